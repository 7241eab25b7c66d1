/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The provider rejected the credentials.
    Unauthorized,
    /// The model provider is rate limited, or the quota is used up.
    RateLimitExceeded,
    /// The content is moderated.
    Moderated,
    /// The provider could not be reached.
    Unavailable,
    /// Any other errors.
    Other,
}
