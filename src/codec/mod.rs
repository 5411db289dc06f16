//! Binary codec shared by the HA wire protocol and the write-ahead log.
//!
//! All multi-byte integers on the wire are big-endian. A message travels as
//! one or more fragments; each fragment is a fixed header followed by
//! operation records:
//!
//! ```text
//! ┌──────────────┬──────────┬──────────┬──────────┬───────┬──────────┬──────────┐
//! │ fragLength:4 │ msgType:2│ msgSqn:8 │ fragSqn:4│ flags │ reserved │ opcount:4│
//! └──────────────┴──────────┴──────────┴──────────┴───────┴──────────┴──────────┘
//!   followed by opcount × [opType:2][opLength:4][payload]
//! ```

pub mod frame;
pub mod layout;
pub mod wire;

pub use frame::{
    clear_no_ack, split_fragment, FragmentHeader, OpIter, OpenFragment, RawOp, FLAG_FLOW_CTRL_ACK,
    FLAG_LAST, FLAG_NO_ACK, FRAGMENT_HEADER_SIZE, OP_HEADER_SIZE,
};
pub use layout::{RecordLayout, StoredFragment};
pub use wire::WireReader;
