//! Ticketing adapter over the Unthread REST client.

use async_trait::async_trait;
use std::time::Duration;
use threadlink_core::ports::{NewTicket, RemoteTicket, TicketingApi, TicketingError};
use threadlink_sdk::client::{ClientError, UnthreadClient};
use threadlink_sdk::objects::unthread::{
    Conversation, CreateConversationRequest, CreateCustomerRequest, OnBehalfOf, PostMessageRequest,
};

use crate::config::runtime::UnthreadConfig;

pub struct UnthreadTicketing {
    client: UnthreadClient,
}

impl UnthreadTicketing {
    pub fn new(config: &UnthreadConfig, request_timeout: Duration) -> Result<Self, TicketingError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TicketingError::Unavailable(e.to_string()))?;
        let client = UnthreadClient::new(config.api_url.clone(), config.api_key.clone()).with_http_client(http);
        Ok(Self { client })
    }
}

#[async_trait]
impl TicketingApi for UnthreadTicketing {
    #[tracing::instrument(skip_all, err, name = "Unthread:createConversation")]
    async fn create_ticket(&self, ticket: NewTicket) -> Result<RemoteTicket, TicketingError> {
        let mut request = CreateConversationRequest::new(ticket.customer_id, ticket.title, ticket.body);
        request.on_behalf_of = Some(OnBehalfOf {
            name: ticket.author_name,
            email: ticket.author_email,
        });
        let conversation = self.client.create_conversation(&request).await.map_err(map_client_error)?;
        remote_ticket(conversation)
    }

    #[tracing::instrument(skip_all, err, name = "Unthread:postMessage", fields(conversation_id = conversation_id))]
    async fn post_reply(&self, conversation_id: &str, text: &str, author_name: &str) -> Result<(), TicketingError> {
        let request = PostMessageRequest::markdown(
            text,
            Some(OnBehalfOf {
                name: author_name.to_string(),
                email: None,
            }),
        );
        self.client
            .post_message(conversation_id, &request)
            .await
            .map_err(map_client_error)?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "Unthread:getConversation", fields(conversation_id = conversation_id))]
    async fn get_ticket(&self, conversation_id: &str) -> Result<RemoteTicket, TicketingError> {
        let conversation = self
            .client
            .get_conversation(conversation_id)
            .await
            .map_err(map_client_error)?;
        remote_ticket(conversation)
    }

    #[tracing::instrument(skip_all, err, name = "Unthread:createCustomer")]
    async fn create_customer(&self, name: &str) -> Result<String, TicketingError> {
        let request = CreateCustomerRequest { name: name.to_string() };
        let customer = self.client.create_customer(&request).await.map_err(map_client_error)?;
        if customer.id.is_empty() {
            return Err(TicketingError::InvalidResponse("customer without id".into()));
        }
        Ok(customer.id)
    }
}

fn remote_ticket(conversation: Conversation) -> Result<RemoteTicket, TicketingError> {
    if conversation.id.is_empty() {
        return Err(TicketingError::InvalidResponse("conversation without id".into()));
    }
    let friendly_id = conversation
        .friendly_id_string()
        .unwrap_or_else(|| conversation.id.clone());
    Ok(RemoteTicket {
        conversation_id: conversation.id,
        friendly_id,
        status: conversation.status,
    })
}

fn map_client_error(e: ClientError) -> TicketingError {
    if e.is_transient() {
        return TicketingError::Unavailable(e.to_string());
    }
    match e {
        ClientError::Json(e) => TicketingError::InvalidResponse(e.to_string()),
        other => TicketingError::Rejected(other.to_string()),
    }
}
