//! Election State
//!
//! Membership rows, the leadership record, and the election handle that
//! drives both.

mod election;
mod leadership;
mod lifecycle;
mod membership;

pub use election::{
    ElectionConfig, ElectionOutcome, ElectionState, LeaderElection, LeaderInfo, LeaderStatus,
    MonitorAction, MonitorReport,
};
pub use leadership::{LeadershipRecord, LeadershipTable};
pub use membership::{Member, MembershipTable};
