//! Per-peer connectivity state machine.
//!
//! Transitions mutate the [`Peer`] and return the side effects the
//! coordinator must carry out against the transport. Nothing here performs
//! I/O or reads the clock; `now` is always passed in.

use std::time::Instant;

use tracing::debug;

use crate::config::SessionConfig;
use crate::identity::DiscoveryInfo;
use crate::peer::{Peer, PeerState};
use crate::protocol::{ProvisionedInfo, SystemMessage};
use crate::transport::SessionState;

/// Work the coordinator performs for one peer after a transition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Open the session if needed and send an invitation.
    Invite { reinvite: bool },
    AcceptInvitation,
    EnsureSession,
    CloseSession,
    CloseStreams,
    Send(SystemMessage),
    /// Send the local device info.
    SendDeviceInfo,
}

/// Why a peer is being disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Requested by the local application.
    Local,
    /// The peer sent a disconnect message.
    Remote,
    HeartbeatTimeout,
    /// Coordinator is stopping; no reconnect.
    Shutdown,
}

/// Result of merging received provisioned info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct InfoMerge {
    pub first: bool,
    pub changed: bool,
}

impl Peer {
    fn set_state(&mut self, next: PeerState, now: Instant, cfg: &SessionConfig) {
        if self.state == next {
            return;
        }
        debug!(peer = %self.label, from = %self.state, to = %next, "peer state");
        self.state = next;
        self.timers.retain_for(next);
        match next {
            PeerState::Invited => {
                self.timers.rsvp = Some(now + cfg.rsvp_interval);
            }
            PeerState::Connected | PeerState::Provisioned => {
                if let Some(timeout) = cfg.ping_timeout {
                    self.timers.ping.get_or_insert(now + cfg.ping_interval);
                    self.timers.ping_timeout.get_or_insert(now + timeout);
                }
                if next == PeerState::Connected && cfg.always_request_info {
                    self.info_retries = 0;
                    self.timers.info_retry = Some(now + cfg.info_retry_interval);
                }
                if next == PeerState::Provisioned {
                    self.backoff.reset();
                }
            }
            PeerState::Disconnected => {
                if let Some(grace) = cfg.hidden_grace {
                    self.timers.hide = Some(now + grace);
                }
            }
            _ => {}
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        let delay = self.backoff.next_delay();
        debug!(peer = %self.label, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.timers.reconnect = Some(now + delay);
    }

    fn mark_connected(&mut self, now: Instant, cfg: &SessionConfig) {
        let next = if self.provisioned_info.is_some() {
            PeerState::Provisioned
        } else {
            PeerState::Connected
        };
        self.set_state(next, now, cfg);
        self.session_state = SessionState::Connected;
        self.last_connected_at = Some(now);
        self.disconnected_at = None;
    }

    fn update_discovery_info(&mut self, info: Option<DiscoveryInfo>) {
        if let Some(info) = info {
            if info != self.discovery_info {
                self.discovery_info = info;
            }
        }
    }

    /// Browser reported the peer.
    pub(crate) fn found(
        &mut self,
        info: Option<DiscoveryInfo>,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Vec<Effect> {
        self.last_seen_at = now;
        self.visible_in_discovery = true;
        self.update_discovery_info(info);
        if !self.state.can_connect() {
            return Vec::new();
        }
        if matches!(self.state, PeerState::Unknown | PeerState::Hidden) {
            self.backoff.reset();
        }
        self.set_state(PeerState::Visible, now, cfg);
        if let Some(last) = self.last_invite_at {
            if now.saturating_duration_since(last) < cfg.invite_cooldown {
                debug!(peer = %self.label, "invite suppressed by cooldown");
                return Vec::new();
            }
        }
        self.invite(now, cfg, false)
    }

    /// Browser no longer sees the peer. The session, if any, is unaffected.
    pub(crate) fn lost(&mut self) {
        self.visible_in_discovery = false;
    }

    /// Send an outbound invitation. A visible peer moves to `Invited`; a
    /// disconnected or hidden peer is re-invited in place so its hide timer
    /// keeps running, with the next attempt already on the backoff schedule.
    pub(crate) fn invite(&mut self, now: Instant, cfg: &SessionConfig, reinvite: bool) -> Vec<Effect> {
        match self.state {
            PeerState::Visible => {
                self.set_state(PeerState::Invited, now, cfg);
            }
            PeerState::Disconnected | PeerState::Hidden if reinvite => {
                if cfg.auto_reconnect {
                    self.schedule_reconnect(now);
                }
            }
            _ => return Vec::new(),
        }
        self.last_invite_at = Some(now);
        vec![Effect::Invite { reinvite }]
    }

    /// The transport refused the invite.
    pub(crate) fn invite_failed(&mut self, now: Instant, cfg: &SessionConfig) {
        if self.state != PeerState::Invited {
            return;
        }
        self.set_state(PeerState::Visible, now, cfg);
        if cfg.auto_reconnect {
            self.schedule_reconnect(now);
        }
    }

    /// Inbound invitation; always accepted.
    pub(crate) fn received_invitation(
        &mut self,
        info: Option<DiscoveryInfo>,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Vec<Effect> {
        self.last_seen_at = now;
        self.update_discovery_info(info);
        if !self.state.is_connected() {
            self.mark_connected(now, cfg);
        }
        vec![Effect::EnsureSession, Effect::AcceptInvitation]
    }

    pub(crate) fn session_state_changed(
        &mut self,
        state: SessionState,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Vec<Effect> {
        self.session_state = state;
        match state {
            SessionState::Connecting => {
                if self.state.is_connected() {
                    return Vec::new();
                }
                self.set_state(PeerState::Connecting, now, cfg);
                vec![Effect::EnsureSession]
            }
            SessionState::Connected => {
                let was_connected = self.state.is_connected();
                self.mark_connected(now, cfg);
                if !was_connected && cfg.always_request_info {
                    vec![Effect::SendDeviceInfo]
                } else {
                    Vec::new()
                }
            }
            SessionState::NotConnected => {
                if self.state.is_connected() {
                    self.set_state(PeerState::Disconnected, now, cfg);
                    self.disconnected_at = Some(now);
                } else if matches!(self.state, PeerState::Invited | PeerState::Connecting) {
                    self.set_state(PeerState::Visible, now, cfg);
                } else {
                    return Vec::new();
                }
                if cfg.auto_reconnect {
                    self.schedule_reconnect(now);
                }
                vec![Effect::CloseStreams]
            }
        }
    }

    /// Tear the peer down. Already disconnected or never-seen peers are left
    /// alone, except on shutdown, which releases whatever they still hold.
    pub(crate) fn disconnect(
        &mut self,
        reason: DisconnectReason,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Vec<Effect> {
        if matches!(
            self.state,
            PeerState::Unknown | PeerState::Hidden | PeerState::Disconnected
        ) {
            if reason != DisconnectReason::Shutdown {
                return Vec::new();
            }
            self.timers.clear();
            self.session_state = SessionState::NotConnected;
            return vec![Effect::CloseStreams, Effect::CloseSession];
        }
        let mut effects = Vec::new();
        if reason == DisconnectReason::Local && self.state.is_connected() {
            effects.push(Effect::Send(SystemMessage::Disconnect));
        }
        effects.push(Effect::CloseStreams);
        effects.push(Effect::CloseSession);
        debug!(peer = %self.label, ?reason, "disconnect");
        self.timers.clear();
        self.set_state(PeerState::Disconnected, now, cfg);
        self.session_state = SessionState::NotConnected;
        self.disconnected_at = Some(now);
        if reason != DisconnectReason::Shutdown && cfg.auto_reconnect {
            self.schedule_reconnect(now);
        }
        effects
    }

    /// Any inbound traffic counts as a heartbeat.
    pub(crate) fn note_traffic(&mut self, now: Instant, cfg: &SessionConfig) {
        self.last_seen_at = now;
        if self.state.is_connected() {
            if let Some(timeout) = cfg.ping_timeout {
                self.timers.ping_timeout = Some(now + timeout);
            }
        }
    }

    /// Merge received provisioned info and promote to `Provisioned`.
    pub(crate) fn merge_info(
        &mut self,
        info: ProvisionedInfo,
        now: Instant,
        cfg: &SessionConfig,
    ) -> InfoMerge {
        if matches!(
            self.state,
            PeerState::Invited | PeerState::Connecting | PeerState::Visible
        ) {
            // Data only arrives over an open session.
            self.mark_connected(now, cfg);
        }
        let first = self.provisioned_info.is_none();
        let merged = self.provisioned_info.get_or_insert_with(ProvisionedInfo::new);
        let mut changed = first;
        for (key, value) in info {
            if merged.get(&key) != Some(&value) {
                merged.insert(key, value);
                changed = true;
            }
        }
        if self.state == PeerState::Connected {
            self.set_state(PeerState::Provisioned, now, cfg);
        }
        InfoMerge { first, changed }
    }

    /// Fire due deadlines. `transport_connected` is whether the transport
    /// currently lists this peer as connected (for the RSVP poll).
    pub(crate) fn tick(
        &mut self,
        now: Instant,
        cfg: &SessionConfig,
        transport_connected: bool,
    ) -> Vec<Effect> {
        let due = |t: Option<Instant>| t.is_some_and(|t| t <= now);
        let mut effects = Vec::new();

        if due(self.timers.ping_timeout) {
            debug!(peer = %self.label, "heartbeat timed out");
            return self.disconnect(DisconnectReason::HeartbeatTimeout, now, cfg);
        }
        if due(self.timers.rsvp) {
            if transport_connected {
                debug!(peer = %self.label, "rsvp poll found peer connected");
                effects.extend(self.session_state_changed(SessionState::Connected, now, cfg));
            } else {
                self.timers.rsvp = Some(now + cfg.rsvp_interval);
            }
        }
        if due(self.timers.ping) {
            effects.push(Effect::Send(SystemMessage::Ping));
            self.timers.ping = Some(now + cfg.ping_interval);
        }
        if due(self.timers.info_retry) {
            if self.info_retries < cfg.info_retry_limit {
                self.info_retries += 1;
                effects.push(Effect::Send(SystemMessage::RequestDeviceInfo));
                self.timers.info_retry = Some(now + cfg.info_retry_interval);
            } else {
                self.timers.info_retry = None;
            }
        }
        if due(self.timers.hide) {
            self.set_state(PeerState::Hidden, now, cfg);
        }
        if due(self.timers.reconnect) {
            self.timers.reconnect = None;
            effects.extend(self.invite(now, cfg, true));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::identity::{PeerHandle, PeerIdentity};
    use crate::peer::Backoff;

    fn cfg() -> SessionConfig {
        SessionConfig::new("nearby", "Local")
    }

    fn peer(now: Instant) -> Peer {
        let cfg = cfg();
        Peer::new(
            PeerIdentity::new("b", "B"),
            PeerHandle::new("b"),
            "B".into(),
            DiscoveryInfo::new(),
            Backoff::new(cfg.reinvite_delay, cfg.reconnect_ceiling, cfg.reconnect_multiplier),
            now,
        )
    }

    fn info(key: &str, value: &str) -> ProvisionedInfo {
        let mut m = ProvisionedInfo::new();
        m.insert(key.into(), value.into());
        m
    }

    #[test]
    fn found_goes_visible_then_invited() {
        let t0 = Instant::now();
        let mut p = peer(t0);
        let effects = p.found(None, t0, &cfg());
        assert_eq!(effects, vec![Effect::Invite { reinvite: false }]);
        assert_eq!(p.state(), PeerState::Invited);
        assert!(p.visible_in_discovery());
        assert!(p.timers.rsvp.is_some());
    }

    #[test]
    fn invite_cooldown_suppresses_repeat_discovery() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.found(None, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert_eq!(p.state(), PeerState::Visible);
        assert!(p.found(None, t0 + Duration::from_secs(1), &c).is_empty());
        assert_eq!(
            p.found(None, t0 + Duration::from_secs(4), &c),
            vec![Effect::Invite { reinvite: false }]
        );
    }

    #[test]
    fn rsvp_poll_forces_connected() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.found(None, t0, &c);
        let t1 = t0 + c.rsvp_interval;
        assert!(p.tick(t1, &c, false).is_empty());
        assert_eq!(p.state(), PeerState::Invited);
        let effects = p.tick(t1 + c.rsvp_interval, &c, true);
        assert_eq!(effects, vec![Effect::SendDeviceInfo]);
        assert_eq!(p.state(), PeerState::Connected);
        assert!(p.timers.rsvp.is_none());
    }

    #[test]
    fn cached_info_returns_straight_to_provisioned() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        let merge = p.merge_info(info("k", "v"), t0, &c);
        assert!(merge.first && merge.changed);
        assert_eq!(p.state(), PeerState::Provisioned);

        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert_eq!(p.disconnected_at(), Some(t0));
        let effects = p.session_state_changed(SessionState::Connected, t0, &c);
        assert_eq!(p.state(), PeerState::Provisioned);
        assert_eq!(effects, vec![Effect::SendDeviceInfo]);
        assert_eq!(p.disconnected_at(), None);
    }

    #[test]
    fn merge_reports_changes_only_when_values_differ() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.merge_info(info("k", "v"), t0, &c);
        let again = p.merge_info(info("k", "v"), t0, &c);
        assert_eq!(again, InfoMerge { first: false, changed: false });
        let other = p.merge_info(info("k", "w"), t0, &c);
        assert!(other.changed && !other.first);
    }

    #[test]
    fn heartbeat_timeout_disconnects_once() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        let late = t0 + Duration::from_secs(11);
        let effects = p.tick(late, &c, true);
        assert_eq!(effects, vec![Effect::CloseStreams, Effect::CloseSession]);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert!(p.timers.ping.is_none() && p.timers.ping_timeout.is_none());
        assert!(p.timers.info_retry.is_none());
        assert!(p.tick(late, &c, true).is_empty());
    }

    #[test]
    fn traffic_pushes_heartbeat_deadline() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.merge_info(info("k", "v"), t0, &c);
        p.note_traffic(t0 + Duration::from_secs(8), &c);
        let effects = p.tick(t0 + Duration::from_secs(11), &c, true);
        assert!(effects.iter().all(|e| *e == Effect::Send(SystemMessage::Ping)));
        assert_eq!(p.state(), PeerState::Provisioned);
    }

    #[test]
    fn info_requests_stop_at_limit() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        let mut requests = 0;
        let mut now = t0;
        for _ in 0..6 {
            now += c.info_retry_interval;
            p.note_traffic(now, &c);
            requests += p
                .tick(now, &c, true)
                .iter()
                .filter(|e| **e == Effect::Send(SystemMessage::RequestDeviceInfo))
                .count();
        }
        assert_eq!(requests, c.info_retry_limit as usize);
    }

    #[test]
    fn disconnected_peer_hides_after_grace() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        let effects = p.tick(t0 + Duration::from_secs(4), &c, false);
        assert_eq!(effects, vec![Effect::Invite { reinvite: true }]);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert!(p.timers.reconnect.is_some());
        p.tick(t0 + Duration::from_secs(5), &c, false);
        assert_eq!(p.state(), PeerState::Hidden);
    }

    #[test]
    fn local_disconnect_notifies_peer_and_schedules_reconnect() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        let effects = p.disconnect(DisconnectReason::Local, t0, &c);
        assert_eq!(
            effects,
            vec![
                Effect::Send(SystemMessage::Disconnect),
                Effect::CloseStreams,
                Effect::CloseSession
            ]
        );
        assert_eq!(p.timers.reconnect, Some(t0 + c.reinvite_delay));
        assert!(p.disconnect(DisconnectReason::Local, t0, &c).is_empty());
    }

    #[test]
    fn shutdown_leaves_no_reconnect() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.disconnect(DisconnectReason::Shutdown, t0, &c);
        assert!(p.timers.reconnect.is_none());
    }

    #[test]
    fn shutdown_releases_dropped_and_hidden_peers() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert!(p.timers.reconnect.is_some() && p.timers.hide.is_some());
        assert!(p.disconnect(DisconnectReason::Local, t0, &c).is_empty());

        let effects = p.disconnect(DisconnectReason::Shutdown, t0, &c);
        assert_eq!(effects, vec![Effect::CloseStreams, Effect::CloseSession]);
        assert!(!p.has_pending_timers());
        assert_eq!(p.state(), PeerState::Disconnected);

        let mut hidden = peer(t0);
        hidden.session_state_changed(SessionState::Connected, t0, &c);
        hidden.session_state_changed(SessionState::NotConnected, t0, &c);
        hidden.tick(t0 + Duration::from_secs(5), &c, false);
        assert_eq!(hidden.state(), PeerState::Hidden);
        assert!(hidden.has_pending_timers());
        hidden.disconnect(DisconnectReason::Shutdown, t0 + Duration::from_secs(5), &c);
        assert!(!hidden.has_pending_timers());
        assert_eq!(hidden.state(), PeerState::Hidden);
    }

    #[test]
    fn shutdown_of_connected_peer_clears_every_timer() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.disconnect(DisconnectReason::Shutdown, t0, &c);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert!(!p.has_pending_timers());
    }

    #[test]
    fn no_auto_reconnect_leaves_dropped_peer_alone() {
        let t0 = Instant::now();
        let mut c = cfg();
        c.auto_reconnect = false;
        let mut p = peer(t0);
        p.found(None, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert_eq!(p.state(), PeerState::Visible);
        assert!(p.timers.reconnect.is_none());

        p.session_state_changed(SessionState::Connected, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert!(p.timers.reconnect.is_none());
        assert!(p.tick(t0 + Duration::from_secs(4), &c, false).is_empty());

        let mut q = peer(t0);
        q.session_state_changed(SessionState::Connected, t0, &c);
        q.disconnect(DisconnectReason::Local, t0, &c);
        assert!(q.timers.reconnect.is_none());
    }

    #[test]
    fn without_hidden_grace_peer_never_hides() {
        let t0 = Instant::now();
        let mut c = cfg();
        c.hidden_grace = None;
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert!(p.timers.hide.is_none());
        let mut now = t0;
        for _ in 0..60 {
            now += Duration::from_secs(1);
            p.tick(now, &c, false);
        }
        assert_eq!(p.state(), PeerState::Disconnected);
    }

    #[test]
    fn without_ping_timeout_no_heartbeat_runs() {
        let t0 = Instant::now();
        let mut c = cfg();
        c.ping_timeout = None;
        let mut p = peer(t0);
        p.session_state_changed(SessionState::Connected, t0, &c);
        assert!(p.timers.ping.is_none() && p.timers.ping_timeout.is_none());
        let effects = p.tick(t0 + Duration::from_secs(60), &c, true);
        assert!(!effects.contains(&Effect::Send(SystemMessage::Ping)));
        assert!(!effects.contains(&Effect::CloseSession));
        assert_eq!(p.state(), PeerState::Connected);
    }

    #[test]
    fn failed_attempts_back_off() {
        let t0 = Instant::now();
        let c = cfg();
        let mut p = peer(t0);
        p.found(None, t0, &c);
        p.session_state_changed(SessionState::NotConnected, t0, &c);
        assert_eq!(p.timers.reconnect, Some(t0 + Duration::from_millis(500)));
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(p.tick(t1, &c, false), vec![Effect::Invite { reinvite: true }]);
        p.invite_failed(t1, &c);
        assert_eq!(p.timers.reconnect, Some(t1 + Duration::from_millis(750)));
    }
}
