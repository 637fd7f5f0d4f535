use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Логирование с временными метками.
/// Повторный вызов ничего не делает (например, из нескольких тестов).
pub fn init(filter: Option<&str>) {
    let filter = filter
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_owned()))
                .with_target(true),
        )
        .try_init();
}

/// Печать ICE-candidate при появлении
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "{label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// Сводка по типам собранных кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.srflx == 0 && summary.relay == 0 {
        warn!("No server-reflexive or relay candidates; connection through NAT may fail");
    }
    summary
}
