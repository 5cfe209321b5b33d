pub mod diff;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod model;
pub mod parsers;
pub mod paths;
pub mod sniff;
pub mod totals;
