// Crate-wide error type. Wire-format failures have their own
// sip::parser::ParseError; everything that crosses a fallible boundary in
// the engine itself lands here.

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CDR write error: {0}")]
    Cdr(String),
}
