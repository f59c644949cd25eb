use crate::peer::gateway::MediaGateway;
use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Кандидаты, полученные до установки remote description.
/// Порядок прихода сохраняется.
#[derive(Debug, Clone, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl PartialEq<Vec<IceCandidate>> for PendingCandidates {
    fn eq(&self, other: &Vec<IceCandidate>) -> bool {
        self.queue.iter().eq(other.iter())
    }
}

/// Применяет удалённые кандидаты строго по очереди одной задачей,
/// чтобы поздние кандидаты не обгоняли отложенные.
pub struct CandidateApplier {
    tx: mpsc::UnboundedSender<IceCandidate>,
    task: JoinHandle<()>,
}

impl CandidateApplier {
    pub fn start(gateway: Arc<dyn MediaGateway>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        let task = tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                gateway.add_remote_candidate(candidate).await;
            }
        });
        Self { tx, task }
    }

    /// Применяет все отложенные кандидаты после установки remote description
    pub fn flush(&self, pending: &mut PendingCandidates) {
        for candidate in pending.drain() {
            debug!(candidate = %candidate.candidate, "applying pending candidate");
            self.push(candidate);
        }
    }

    pub fn push(&self, candidate: IceCandidate) {
        if self.tx.send(candidate).is_err() {
            warn!("candidate applier already stopped, candidate dropped");
        }
    }
}

impl Drop for CandidateApplier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn to_rtc_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub fn from_rtc_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Грубая проверка строки кандидата до передачи в транспорт
pub fn looks_valid(candidate: &IceCandidate) -> bool {
    let body = candidate
        .candidate
        .strip_prefix("candidate:")
        .unwrap_or(&candidate.candidate);
    body.split_whitespace().count() >= 8 && body.contains(" typ ")
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(host_count, srflx_count, relay_count, "candidate analysis");

    if relay_count == 0 && !candidates.is_empty() {
        debug!("no TURN relay candidates found, connection through NAT may fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn pending_queue_keeps_arrival_order() {
        let mut pending = PendingCandidates::default();
        pending.push(cand(1));
        pending.push(cand(2));
        pending.push(cand(3));
        let drained: Vec<_> = pending.drain().collect();
        assert_eq!(drained, vec![cand(1), cand(2), cand(3)]);
        assert!(pending.is_empty());
    }

    #[test]
    fn candidate_shape_check() {
        assert!(looks_valid(&cand(1)));
        let broken = IceCandidate {
            candidate: "candidate:garbage".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(!looks_valid(&broken));
    }

    #[test]
    fn rtc_init_conversion_keeps_fields() {
        let original = cand(7);
        assert_eq!(from_rtc_init(to_rtc_init(original.clone())), original);
    }
}
