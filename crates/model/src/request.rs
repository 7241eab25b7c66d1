/// A request to be sent to the model provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ModelRequest {
    /// The input messages, in conversation order.
    pub messages: Vec<ModelMessage>,
}

impl ModelRequest {
    /// Returns the number of messages that are not system instructions.
    #[inline]
    pub fn conversation_len(&self) -> usize {
        self.messages
            .iter()
            .filter(|msg| !matches!(msg, ModelMessage::System(_)))
            .count()
    }
}

/// A complete message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelMessage {
    /// The system instructions.
    System(String),
    /// A user input text.
    User(String),
    /// An assistant text.
    Assistant(String),
}
