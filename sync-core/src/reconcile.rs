//! Reconciliation decision table.
//!
//! Given what the server reported and what the local replica holds, pick the
//! single action a sync performs. Pure: the engine in sync-client carries
//! the action out.

use walletsync_types::FetchStatus;

/// What a sync should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing to do (nothing anywhere, or already in sync).
    None,
    /// Upload local (or delete the remote copy, if the user opted out).
    Push,
    /// Adopt the remote version.
    Pull,
    /// Both sides changed since the last common version. Nothing is touched.
    Conflict,
}

/// Decide the action for one sync.
///
/// `has_local` is whether a local encrypted wallet exists, `dirty_local`
/// whether its hash differs from the last synced hash.
///
/// | server status | local | dirty | action |
/// |---|---|---|---|
/// | NoContent | no | - | None |
/// | NoContent | yes | - | Push |
/// | NotModified | no | - | None |
/// | NotModified | yes | no | None |
/// | NotModified | yes | yes | Push |
/// | Ok | no | - | Pull |
/// | Ok | yes | no | Pull |
/// | Ok | yes | yes | Conflict |
pub fn decide(remote: FetchStatus, has_local: bool, dirty_local: bool) -> SyncAction {
    match (remote, has_local, dirty_local) {
        (FetchStatus::NoContent, false, _) => SyncAction::None,
        (FetchStatus::NoContent, true, _) => SyncAction::Push,
        (FetchStatus::NotModified, false, _) => SyncAction::None,
        (FetchStatus::NotModified, true, false) => SyncAction::None,
        (FetchStatus::NotModified, true, true) => SyncAction::Push,
        (FetchStatus::Ok, false, _) => SyncAction::Pull,
        (FetchStatus::Ok, true, false) => SyncAction::Pull,
        (FetchStatus::Ok, true, true) => SyncAction::Conflict,
    }
}
