pub mod counters;
pub mod pager;
pub mod reactions;
pub mod text;
