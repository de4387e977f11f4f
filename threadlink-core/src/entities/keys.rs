//! Storage key namespaces.
//!
//! The primary namespaces are read by external inspection tooling and must
//! not change. The index namespaces are private to this process.

/// `ticket:{conversationId}`
pub fn ticket(conversation_id: &str) -> String {
    format!("ticket:{conversation_id}")
}

/// `customer:telegram:{chatId}`
pub fn customer_by_chat(chat_id: i64) -> String {
    format!("customer:telegram:{chat_id}")
}

/// `customer:id:{customerId}`
pub fn customer_by_id(customer_id: &str) -> String {
    format!("customer:id:{customer_id}")
}

/// `user-state:{userId}`
pub fn user_state(user_id: i64) -> String {
    format!("user-state:{user_id}")
}

/// `admin:{telegramUserId}`
pub fn admin(telegram_user_id: i64) -> String {
    format!("admin:{telegram_user_id}")
}

/// `group-config:{chatId}`
pub fn group_config(chat_id: i64) -> String {
    format!("group-config:{chat_id}")
}

/// `dm-setup:{sessionId}`
pub fn dm_setup(session_id: &str) -> String {
    format!("dm-setup:{session_id}")
}

/// `global-config:{name}`
pub fn global_config(name: &str) -> String {
    format!("global-config:{name}")
}

// -- Indices ---------------------------------------------------------------

/// Conversation ids of every ticket opened from a chat.
pub fn chat_tickets(chat_id: i64) -> String {
    format!("chat-tickets:{chat_id}")
}

pub fn ticket_by_friendly_id(friendly_id: &str) -> String {
    format!("ticket-friendly:{friendly_id}")
}

/// The ticket whose confirmation message is `message_id` in `chat_id`.
pub fn ticket_by_message(chat_id: i64, message_id: i64) -> String {
    format!("ticket-message:{chat_id}:{message_id}")
}

/// The ticket an agent reply delivered as `message_id` belongs to.
pub fn agent_message(chat_id: i64, message_id: i64) -> String {
    format!("agent-message:{chat_id}:{message_id}")
}

/// Agent reply messages delivered for a conversation, oldest first.
pub fn ticket_agent_messages(conversation_id: &str) -> String {
    format!("ticket-agent-messages:{conversation_id}")
}

/// The active setup session of an admin.
pub fn dm_setup_by_admin(admin_user_id: i64) -> String {
    format!("dm-setup:admin:{admin_user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_namespaces() {
        assert_eq!(ticket("c-1"), "ticket:c-1");
        assert_eq!(customer_by_chat(-100123), "customer:telegram:-100123");
        assert_eq!(customer_by_id("cu_9"), "customer:id:cu_9");
        assert_eq!(user_state(42), "user-state:42");
        assert_eq!(admin(42), "admin:42");
        assert_eq!(group_config(-5), "group-config:-5");
        assert_eq!(dm_setup("s-1"), "dm-setup:s-1");
        assert_eq!(global_config("message-templates"), "global-config:message-templates");
    }
}
