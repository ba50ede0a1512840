//! Transfer plane — direct peer-to-peer file streaming over TCP.
//!
//! Every peer runs a [`TransferManager`] that serves the files in its local
//! [`ByteSource`] and fetches files from other peers into its [`ByteSink`].
//! Each exchange is a [`TransferSession`] moving through
//! NEGOTIATING → STREAMING → COMPLETED | ABORTED, independent of the control
//! plane and of every other session.

pub mod manager;
pub mod protocol;
pub mod session;
pub mod store;

pub use manager::{TransferEvent, TransferManager};
pub use protocol::{TransferRequest, TransferResponse, TransferStatus};
pub use session::{TransferRole, TransferSession, TransferState};
pub use store::{ByteSink, ByteSource, LocalDirectory, SourceFile};
