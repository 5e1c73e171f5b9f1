//! fio job construction for each workload kind.

use super::WorkloadKind;

/// Parameters of one workload phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    /// fio job name; also how the phase is found again in the output.
    pub name: &'static str,
    pub rw: &'static str,
    /// Read share of a mixed workload, percent.
    pub rwmixread: Option<u8>,
    pub block_size: &'static str,
    pub numjobs: u32,
    pub iodepth: Option<u32>,
    pub size: &'static str,
}

pub const AI_DATA_LOAD: PhaseSpec = PhaseSpec {
    name: "ai_data_load",
    rw: "randrw",
    rwmixread: Some(70),
    block_size: "128k",
    numjobs: 8,
    iodepth: Some(32),
    size: "4G",
};

pub const AI_CHECKPOINT: PhaseSpec = PhaseSpec {
    name: "ai_model_checkpoint",
    rw: "write",
    rwmixread: None,
    block_size: "1M",
    numjobs: 4,
    iodepth: Some(16),
    size: "2G",
};

pub const STANDARD_RANDOM: PhaseSpec = PhaseSpec {
    name: "standard_randrw",
    rw: "randrw",
    rwmixread: None,
    block_size: "4k",
    numjobs: 4,
    iodepth: None,
    size: "1G",
};

/// Phases of `kind`, in execution order.
pub fn phases(kind: WorkloadKind) -> &'static [PhaseSpec] {
    match kind {
        WorkloadKind::AiSimulated => &[AI_DATA_LOAD, AI_CHECKPOINT],
        WorkloadKind::StandardRandom => &[STANDARD_RANDOM],
    }
}

/// A complete fio invocation against one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FioJob {
    pub device_path: String,
    pub kind: WorkloadKind,
    pub duration_secs: u64,
    pub ioengine: String,
    pub checkpoint_share_percent: u8,
}

impl FioJob {
    /// Time budget of each phase. The phases always add up to the run duration.
    pub fn phase_durations(&self) -> Vec<(PhaseSpec, u64)> {
        match self.kind {
            WorkloadKind::StandardRandom => vec![(STANDARD_RANDOM, self.duration_secs)],
            WorkloadKind::AiSimulated => {
                let share = u64::from(self.checkpoint_share_percent.min(90));
                let checkpoint = (self.duration_secs * share / 100)
                    .max(1)
                    .min(self.duration_secs.saturating_sub(1));
                let data_load = self.duration_secs - checkpoint;
                vec![(AI_DATA_LOAD, data_load), (AI_CHECKPOINT, checkpoint)]
            }
        }
    }

    /// Command-line arguments. Global options come first; each phase after the
    /// first is stonewalled so phases run back to back.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--filename={}", self.device_path),
            "--direct=1".to_string(),
            format!("--ioengine={}", self.ioengine),
            "--group_reporting".to_string(),
            "--time_based".to_string(),
            "--eta=never".to_string(),
        ];

        for (i, (phase, secs)) in self.phase_durations().into_iter().enumerate() {
            args.push(format!("--name={}", phase.name));
            if i > 0 {
                args.push("--stonewall".to_string());
            }
            args.push(format!("--rw={}", phase.rw));
            if let Some(mix) = phase.rwmixread {
                args.push(format!("--rwmixread={}", mix));
            }
            args.push(format!("--bs={}", phase.block_size));
            args.push(format!("--numjobs={}", phase.numjobs));
            if let Some(depth) = phase.iodepth {
                args.push(format!("--iodepth={}", depth));
            }
            args.push(format!("--size={}", phase.size));
            args.push(format!("--runtime={}", secs));
        }

        args
    }
}
