pub mod mock_chat_client;

pub use mock_chat_client::MockChatClient;
