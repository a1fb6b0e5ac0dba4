pub mod dns;
pub mod matcher;
pub mod quic;
pub mod tls;

pub use matcher::{Matcher, SuffixSet};
