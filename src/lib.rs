//! Rewards Ledger - account ledger and entitlement engine for a rewards bot
//!
//! Holds each user's credits, plan, referral graph and task/redemption
//! history, and applies every change under a per-user lock so duplicate
//! taps, retries and redelivered webhooks cannot double-spend or
//! double-credit.
//!
//! ## Architecture
//!
//! - **UserStore**: one JSON record per user in sled, upcast on load
//! - **Ledger**: lock -> load -> validate -> mutate -> save, per user id
//! - **CodeRegistry**: global one-time codes, claimed by compare-and-swap
//! - **Replicator**: write-behind copy of every commit to a mirror directory
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/rewards-ledger/
//! ├── ledger.sled/           # users, codes, tasks and giveaways trees
//! ├── mirror/                # Write-behind copy of users and codes
//! │   ├── users/
//! │   └── codes/
//! └── config.toml            # Configuration
//! ```

pub mod clock;
pub mod codes;
pub mod config;
pub mod error;
pub mod giveaways;
pub mod ledger;
pub mod locks;
pub mod plans;
pub mod record;
pub mod replication;
pub mod store;
pub mod tasks;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use codes::{PlanGrant, RedeemCode, Reward};
pub use config::{Config, LedgerRules};
pub use error::{ErrorClass, LedgerError, Rejection, StorageError};
pub use giveaways::Giveaway;
pub use ledger::{retry_transient, Ledger, Registration, RestoreReport};
pub use plans::{Action, PlanName};
pub use record::{UserId, UserRecord};
pub use replication::{FsMirror, MirrorSink, Replicator};
pub use store::LedgerDb;
pub use tasks::Task;
