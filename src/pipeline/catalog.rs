use crate::models::{JobKind, RunState};

/// One step in a pipeline's fixed execution order.
///
/// `weight` is the fraction of overall completion a job sitting in this
/// phase represents, used by parent progress aggregation.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub is_gate: bool,
    pub weight: f64,
}

const fn phase(name: &'static str, weight: f64) -> PhaseSpec {
    PhaseSpec {
        name,
        is_gate: false,
        weight,
    }
}

const fn gate(name: &'static str, weight: f64) -> PhaseSpec {
    PhaseSpec {
        name,
        is_gate: true,
        weight,
    }
}

const BOARD_MIGRATION_PHASES: &[PhaseSpec] = &[
    phase("importing_board", 0.05),
    phase("importing_lists", 0.20),
    phase("importing_cards", 0.50),
    phase("importing_checklists", 0.75),
    phase("finalizing", 0.90),
];

const SEO_CONTENT_PHASES: &[PhaseSpec] = &[
    phase("research", 0.10),
    phase("outline", 0.20),
    gate("approval_outline", 0.25),
    phase("drafting", 0.55),
    gate("approval_draft", 0.60),
    phase("polishing", 0.80),
    gate("approval_publish", 0.85),
];

const PAGE_FORGE_PHASES: &[PhaseSpec] = &[
    phase("planning_structure", 0.15),
    gate("approval_structure", 0.20),
    phase("building_pages", 0.55),
    phase("visual_qa", 0.75),
    gate("approval_launch", 0.80),
];

/// The fixed phase order for a pipeline kind.
pub fn phases(kind: JobKind) -> &'static [PhaseSpec] {
    match kind {
        JobKind::BoardMigration => BOARD_MIGRATION_PHASES,
        JobKind::SeoContent => SEO_CONTENT_PHASES,
        JobKind::PageForge => PAGE_FORGE_PHASES,
    }
}

/// Completion weight of a named phase, for progress aggregation.
pub fn phase_weight(kind: JobKind, phase_name: &str) -> Option<f64> {
    phases(kind)
        .iter()
        .find(|p| p.name == phase_name)
        .map(|p| p.weight)
}

/// Index of a gate phase by name. `None` for unknown names and for
/// phases that are not gates.
pub fn gate_index(kind: JobKind, gate_name: &str) -> Option<usize> {
    phases(kind)
        .iter()
        .position(|p| p.is_gate && p.name == gate_name)
}

/// Where a revise decision at `gate_index` sends execution: the nearest
/// prior non-gate phase, falling back to 0.
pub fn revise_target(kind: JobKind, gate_index: usize) -> usize {
    let order = phases(kind);
    (0..gate_index.min(order.len()))
        .rev()
        .find(|&i| !order[i].is_gate)
        .unwrap_or(0)
}

/// Render a typed run state to its stored/wire status string: a phase
/// name, `awaiting_<gate>`, or one of the fixed words.
pub fn render_run_status(kind: JobKind, state: &RunState) -> String {
    let order = phases(kind);
    match state {
        RunState::Pending => "pending".to_string(),
        RunState::Completed => "completed".to_string(),
        RunState::Scrapped => "scrapped".to_string(),
        RunState::Failed => "failed".to_string(),
        RunState::InPhase(i) => match order.get(*i) {
            Some(p) => p.name.to_string(),
            None => format!("phase_{}", i),
        },
        RunState::AwaitingGate(i) => match order.get(*i) {
            Some(p) => format!("awaiting_{}", p.name),
            None => format!("awaiting_phase_{}", i),
        },
    }
}

/// Parse a stored status string back into a typed run state.
pub fn parse_run_status(kind: JobKind, status: &str) -> Result<RunState, String> {
    match status {
        "pending" => return Ok(RunState::Pending),
        "completed" => return Ok(RunState::Completed),
        "scrapped" => return Ok(RunState::Scrapped),
        "failed" => return Ok(RunState::Failed),
        _ => {}
    }
    let order = phases(kind);
    if let Some(gate) = status.strip_prefix("awaiting_") {
        return match order.iter().position(|p| p.is_gate && p.name == gate) {
            Some(i) => Ok(RunState::AwaitingGate(i)),
            None => Err(format!("Unknown gate in run status: {}", status)),
        };
    }
    match order.iter().position(|p| p.name == status) {
        Some(i) => Ok(RunState::InPhase(i)),
        None => Err(format!("Unknown run status: {}", status)),
    }
}
