//! Domain types: archives, periods, tenants, and archived records.

pub mod archive;
pub mod period;
pub mod record;
pub mod tenant;

pub use archive::{Archive, ArchiveState, ArchiveType};
pub use period::{Period, TimeRange};
pub use record::Record;
pub use tenant::Tenant;
