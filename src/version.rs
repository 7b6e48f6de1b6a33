use std::fmt::{self, Display};

/// HTTP protocol version used to carry a JPIP request/reply.
///
/// JPIP is specified over HTTP/1.x; `Http20` is kept for symmetry with the
/// wire parser (which must still recognise a server that claims it) but is
/// never selected for an outgoing request.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    Http10,
    Http11,
    Http20,
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Version::*;
        f.write_str(match *self {
            Http10 => "HTTP/1.0",
            Http11 => "HTTP/1.1",
            Http20 => "HTTP/2",
        })
    }
}

impl Version {
    pub fn parse(bytes: u8) -> Version {
        if bytes >= 1 { Version::Http11 } else { Version::Http10 }
    }
}
