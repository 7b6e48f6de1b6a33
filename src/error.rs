use std::io;

use quick_error::quick_error;

quick_error! {
    /// Fatal and non-fatal error conditions surfaced by the engine.
    ///
    /// Most variants are fatal for the CID (or the whole session, when
    /// noted) that produced them; the manager loop decides what to tear
    /// down based on which of those two buckets a variant falls in via
    /// [`Error::scope`]. None of these are ever used for flow-control
    /// anomalies -- those are silently tolerated, per the flow regulator's
    /// "failure mode: none" contract.
    #[derive(Debug)]
    pub enum Error {
        /// Illegal VBAS, unknown content-type, negative length, unparsable
        /// context header, or a `cnew` reply missing its `cid` parameter.
        MalformedResponse(msg: String) {
            description("malformed server response")
            display("malformed server response: {}", msg)
        }
        /// `JPIP-tid` in a reply differs from a previously stored target id.
        TargetChanged(old: String, new: String) {
            description("JPIP target changed")
            display("JPIP-tid changed from {:?} to {:?}; cache is invalid", old, new)
        }
        /// TCP connect/read/write returned an unrecoverable error.
        Transport(err: io::Error) {
            description("transport failure")
            display("transport failure: {}", err)
            from()
        }
        /// The aux channel did not complete its connect handshake in time.
        AuxConnectTimeout {
            description("auxiliary channel connect timed out")
        }
        /// `range_length < 0`, `bin_id < 0`, or any other VBAS field that
        /// can't be resynchronised from.
        IllegalVbas(msg: String) {
            description("illegal VBAS parameter")
            display("illegal VBAS parameter: {}", msg)
        }
        /// A hex-encoded name from the network was >= 64 KiB.
        NameTooLarge(len: usize, limit: usize) {
            description("name exceeds maximum size")
            display("name of {} bytes exceeds limit of {}", len, limit)
        }
        /// Programmer/API-misuse error: calling a builder method in the
        /// wrong state. Kept distinct from network-triggered errors so
        /// callers never mistake a local bug for a server problem.
        InvalidState(msg: String) {
            description("invalid engine state")
            display("invalid engine state: {}", msg)
        }
    }
}

impl Error {
    /// Whether this error is fatal only for the CID that raised it
    /// (so other CIDs on the same session may continue), or for the
    /// whole session.
    pub fn session_fatal(&self) -> bool {
        matches!(self, Error::TargetChanged(..) | Error::MalformedResponse(..))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
