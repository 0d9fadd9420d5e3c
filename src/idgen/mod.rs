//! Identity allocation.
//!
//! Two generators with different trade-offs: [`snowflake::Snowflake`]
//! mints globally-unique, time-ordered upload ids with no storage round
//! trip, while [`segment::SegmentAllocator`] hands out dense ids from
//! windows claimed transactionally in the metadata store.

pub mod segment;
pub mod snowflake;
