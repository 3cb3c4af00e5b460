//! Sockets and the streams built on them

mod connector;
mod input;
mod output;
mod pacer;
mod rate;
mod socket;
mod target;

pub use connector::Connector;
pub use input::{DatagramFilter, InputStream, InputStreamStats, ReadOutcome, TransferHandler};
pub use output::{OutputStream, OutputStreamStats};
pub use pacer::Pacer;
pub use rate::RateStatistics;
pub use socket::{StreamChannel, StreamConnector, TransportKind};
pub use target::Target;
