//! Pure reconciliation planning
//!
//! Given the roster, the links that exist and whether local media is on,
//! decide which links to close, which to create and which to renegotiate.
//! Nothing here touches a transport; the coordinator executes the plan.

use super::link::PeerLink;
use crate::participant::{CameraStateMap, RemoteStream};
use watchsync_signaling::ParticipantRecord;

/// What the planner needs to know about an existing link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSummary<'a> {
    /// Remote connection ID
    pub connection_id: &'a str,
    /// Whether local tracks are already attached
    pub has_local_tracks_attached: bool,
}

/// Minimal set of link operations bringing the mesh in line with the roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Links to close
    pub close: Vec<String>,
    /// Peers to connect to and send an offer
    pub create: Vec<String>,
    /// Links that need local tracks and a fresh offer
    pub renegotiate: Vec<String>,
}

impl ReconcilePlan {
    /// Whether nothing needs doing
    pub fn is_empty(&self) -> bool {
        self.close.is_empty() && self.create.is_empty() && self.renegotiate.is_empty()
    }
}

/// Remote participants eligible for a direct link, in roster order
pub fn desired_peers<'a>(
    self_id: &str,
    roster: &'a [ParticipantRecord],
    max_remote_links: usize,
) -> Vec<&'a ParticipantRecord> {
    roster
        .iter()
        .filter(|p| p.connection_id != self_id)
        .take(max_remote_links)
        .collect()
}

/// Compute the plan for one reconciliation pass
pub fn plan_links(
    self_id: &str,
    roster: &[ParticipantRecord],
    existing: &[LinkSummary<'_>],
    local_media_active: bool,
    max_remote_links: usize,
) -> ReconcilePlan {
    let others = desired_peers(self_id, roster, max_remote_links);
    let wanted = |id: &str| others.iter().any(|p| p.connection_id == id);

    let mut plan = ReconcilePlan::default();
    for link in existing {
        if !wanted(link.connection_id) {
            plan.close.push(link.connection_id.to_string());
        } else if local_media_active && !link.has_local_tracks_attached {
            plan.renegotiate.push(link.connection_id.to_string());
        }
    }

    if local_media_active {
        for peer in &others {
            if !existing
                .iter()
                .any(|link| link.connection_id == peer.connection_id)
            {
                plan.create.push(peer.connection_id.clone());
            }
        }
    }

    plan.close.sort();
    plan.renegotiate.sort();
    plan
}

/// Links worth rendering: those whose peer is broadcasting, by connection ID
pub(crate) fn remote_streams<'a>(
    links: impl Iterator<Item = &'a PeerLink>,
    camera_states: &CameraStateMap,
) -> Vec<RemoteStream> {
    let mut streams: Vec<RemoteStream> = links
        .filter(|link| camera_states.is_broadcasting(&link.connection_id))
        .map(|link| RemoteStream {
            connection_id: link.connection_id.clone(),
            nickname: link.nickname.clone(),
            tracks: link.remote_tracks.clone(),
        })
        .collect();
    streams.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
    streams
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> Vec<ParticipantRecord> {
        ids.iter()
            .map(|id| ParticipantRecord::new(*id, id.to_uppercase()))
            .collect()
    }

    fn link(id: &str, attached: bool) -> LinkSummary<'_> {
        LinkSummary {
            connection_id: id,
            has_local_tracks_attached: attached,
        }
    }

    #[test]
    fn test_self_is_never_planned() {
        let plan = plan_links("a", &roster(&["a", "b", "c"]), &[], true, 5);
        assert_eq!(plan.create, vec!["b", "c"]);
        assert!(plan.close.is_empty());
    }

    #[test]
    fn test_inactive_media_creates_nothing() {
        let plan = plan_links("a", &roster(&["a", "b"]), &[], false, 5);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_cap_limits_peers() {
        let ids: Vec<String> = (0..9).map(|n| format!("p{}", n)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let plan = plan_links("p0", &roster(&refs), &[], true, 5);
        assert_eq!(plan.create, vec!["p1", "p2", "p3", "p4", "p5"]);

        // a link to a peer beyond the cap is closed
        let plan = plan_links("p0", &roster(&refs), &[link("p7", true)], true, 5);
        assert_eq!(plan.close, vec!["p7"]);
        assert_eq!(plan.create.len(), 5);
    }

    #[test]
    fn test_departed_peer_is_closed() {
        let plan = plan_links(
            "a",
            &roster(&["a", "c"]),
            &[link("b", true), link("c", true)],
            true,
            5,
        );
        assert_eq!(plan.close, vec!["b"]);
        assert!(plan.create.is_empty());
        assert!(plan.renegotiate.is_empty());
    }

    #[test]
    fn test_links_without_tracks_are_renegotiated_once_media_is_on() {
        let existing = [link("b", false)];
        let plan = plan_links("a", &roster(&["a", "b"]), &existing, false, 5);
        assert!(plan.is_empty());

        let plan = plan_links("a", &roster(&["a", "b"]), &existing, true, 5);
        assert_eq!(plan.renegotiate, vec!["b"]);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn test_plan_is_idempotent_once_applied() {
        let people = roster(&["a", "b", "c"]);
        let first = plan_links("a", &people, &[], true, 5);
        let applied: Vec<LinkSummary> = first.create.iter().map(|id| link(id, true)).collect();
        let second = plan_links("a", &people, &applied, true, 5);
        assert!(second.is_empty());
    }
}
