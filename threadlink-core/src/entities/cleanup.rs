use super::{CustomerRepository, TicketRepository};
use tracing::{info, warn};

/// What [`ChatCleanup::cleanup_chat`] managed to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub chat_id: i64,
    pub tickets_removed: Vec<String>,
    pub customer_removed: Option<String>,
    /// Human-readable description of every step that failed or was partial.
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drops every local mapping of a chat that can no longer be reached.
///
/// Remote tickets and customers are left alone.
#[derive(Clone)]
pub struct ChatCleanup {
    tickets: TicketRepository,
    customers: CustomerRepository,
}

impl ChatCleanup {
    pub fn new(tickets: TicketRepository, customers: CustomerRepository) -> Self {
        Self { tickets, customers }
    }

    /// Never fails; problems are logged and listed in the report.
    pub async fn cleanup_chat(&self, chat_id: i64) -> CleanupReport {
        let mut report = CleanupReport {
            chat_id,
            ..Default::default()
        };

        match self.tickets.list_for_chat(chat_id).await {
            Ok(tickets) => {
                for ticket in tickets {
                    let deleted = self.tickets.delete(&ticket).await;
                    if !deleted.is_complete() {
                        report.failures.push(format!(
                            "ticket {} pending delete on {:?}",
                            ticket.conversation_id, deleted.skipped
                        ));
                    }
                    report.tickets_removed.push(ticket.conversation_id);
                }
            }
            Err(e) => report.failures.push(format!("listing tickets: {e}")),
        }

        match self.customers.find_by_chat(chat_id).await {
            Ok(Some(customer)) => {
                let deleted = self.customers.delete(&customer).await;
                if !deleted.is_complete() {
                    report.failures.push(format!(
                        "customer {} pending delete on {:?}",
                        customer.unthread_customer_id,
                        deleted.incomplete_indices()
                    ));
                }
                report.customer_removed = Some(customer.unthread_customer_id);
            }
            Ok(None) => {}
            Err(e) => report.failures.push(format!("reading customer: {e}")),
        }

        if report.is_clean() {
            info!(
                chat_id,
                tickets = report.tickets_removed.len(),
                customer = ?report.customer_removed,
                "Chat mappings removed"
            );
        } else {
            warn!(chat_id, failures = ?report.failures, "Chat cleanup incomplete");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AgentMessageLink, Customer, Ticket};
    use time::OffsetDateTime;
    use crate::test_support::memory_storage;

    #[tokio::test]
    async fn test_cleanup_removes_only_that_chat() {
        let storage = memory_storage();
        let tickets = TicketRepository::new(storage.clone());
        let customers = CustomerRepository::new(storage.clone());
        let cleanup = ChatCleanup::new(tickets.clone(), customers.clone());

        tickets.save(&Ticket::new("c-1", "1", 555, 10, "cu_1")).await.unwrap();
        tickets.save(&Ticket::new("c-2", "2", 555, 11, "cu_1")).await.unwrap();
        tickets.save(&Ticket::new("c-3", "3", 777, 12, "cu_2")).await.unwrap();
        customers.save(&Customer::new("cu_1", 555, "Acme")).await.unwrap();
        customers.save(&Customer::new("cu_2", 777, "Globex")).await.unwrap();
        tickets
            .record_agent_message(&AgentMessageLink {
                chat_id: 555,
                message_id: 1000,
                conversation_id: "c-1".into(),
                sent_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        let report = cleanup.cleanup_chat(555).await;
        assert!(report.is_clean());
        assert_eq!(report.tickets_removed, vec!["c-1".to_string(), "c-2".to_string()]);
        assert_eq!(report.customer_removed.as_deref(), Some("cu_1"));

        assert_eq!(tickets.get("c-1").await.unwrap(), None);
        assert_eq!(customers.find_by_id("cu_1").await.unwrap(), None);
        assert_eq!(tickets.find_agent_message(555, 1000).await.unwrap(), None);
        assert!(tickets.get("c-3").await.unwrap().is_some());
        assert!(customers.find_by_chat(777).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_of_unknown_chat_is_empty() {
        let storage = memory_storage();
        let cleanup = ChatCleanup::new(
            TicketRepository::new(storage.clone()),
            CustomerRepository::new(storage),
        );
        let report = cleanup.cleanup_chat(1).await;
        assert!(report.is_clean());
        assert!(report.tickets_removed.is_empty());
        assert_eq!(report.customer_removed, None);
    }
}
