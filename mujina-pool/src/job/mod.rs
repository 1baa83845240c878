//! The job pipeline: templates in, ASIC jobs out, nonces back.

pub mod builder;
pub mod extranonce2;
pub mod merkle;
pub mod result;
pub mod table;
pub mod ticker;

pub use builder::{AsicJob, DEFAULT_STRATUM_DIFFICULTY, JobBuilder, MiningInfo};
pub use extranonce2::Extranonce2;
pub use result::{ResultProcessor, ShareSink, Verdict};
pub use table::AsicJobTable;
pub use ticker::{JobTicker, WorkSource};
