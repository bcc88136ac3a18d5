// SIP wire protocol: data model, parser, formatter, URI handling

pub mod formatter;
pub mod message;
pub mod parser;
pub mod uri;
