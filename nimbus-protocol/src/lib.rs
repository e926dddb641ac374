//! Wire-level contracts shared by the Nimbus runtime and its protocol
//! emulator: invocation metadata, structured error reports, the header
//! and path constants of the control-plane API, and the injectable
//! payload codec.

pub mod codec;
pub mod invocation;
pub mod report;

pub use codec::{Codec, CodecError, JsonCodec};
pub use invocation::Invocation;
pub use report::ErrorReport;
