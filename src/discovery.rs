//! Join coordination for opened resources.

use crate::error::Result;
use crate::p2p::{JoinOpts, Swarm};
use crate::repo::DataStore;
use crate::resource::Core;

/// Registers a resource's topic on the swarm and waits for the appropriate
/// settling point:
///
/// * writable: wait until the announce is flushed so lookers can find us
/// * read-only and empty: wait for the announce, then block until the first
///   entry arrives from a peer, there is nothing readable before that
/// * read-only with entries: return immediately, stale reads are fine and
///   mirroring catches up in the background
///
/// Idempotent per resource. The registration slot is locked for the
/// duration of the swarm join, so concurrent callers never register twice.
/// No timeout is applied, callers wrap this in their own deadline if
/// unbounded waiting is unacceptable.
pub(crate) async fn join_resource<TStore, TSwarm>(
    swarm: &TSwarm,
    core: &Core<TStore>,
    opts: JoinOpts,
) -> Result<()>
where
    TStore: DataStore,
    TSwarm: Swarm,
{
    let flushed = {
        let mut slot = core.discovery_slot().lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let discovery = swarm.join(core.discovery_key(), opts).await?;
        let flushed = discovery.flushed_future();
        *slot = Some(discovery);
        flushed
    };

    if core.writable() {
        flushed.await;
    } else if core.is_empty() {
        core.set_finding_peers(true);
        flushed.await;
        let updated = core.update().await;
        core.set_finding_peers(false);
        updated?;
    }
    Ok(())
}
