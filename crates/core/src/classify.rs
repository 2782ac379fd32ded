//! Kernel-fault line classifier.
//!
//! Each anomaly type ships a built-in keyword set and regex set;
//! configuration may extend or replace them per type. Classification is a
//! pure function over a prebuilt [`DetectorSet`] so regexes compile once
//! per config snapshot, not per line.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::DetectorOverride;
use crate::event::AnomalyType;

/// How a detector decides whether a line matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Keyword,
    Regex,
    /// Keywords first; regexes only consulted for types the keywords
    /// did not already match.
    #[default]
    Mixed,
}

impl DetectionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(DetectionMode::Keyword),
            "regex" => Some(DetectionMode::Regex),
            "mixed" => Some(DetectionMode::Mixed),
            _ => None,
        }
    }
}

/// Built-in keyword inventory per anomaly type. Matching is
/// case-insensitive substring presence.
fn builtin_keywords(t: AnomalyType) -> &'static [&'static str] {
    match t {
        AnomalyType::Oom => &[
            "Out of memory",
            "oom-killer",
            "Killed process",
            "Memory cgroup out of memory",
        ],
        AnomalyType::KernelPanic => &[
            "Kernel panic",
            "not syncing",
            "System halted",
            "sysrq triggered crash",
            "Unable to mount root",
        ],
        AnomalyType::UnexpectedReboot => &[
            "unexpectedly shut down",
            "unexpected restart",
            "system reboot",
            "restart triggered by hardware",
        ],
        AnomalyType::FsError => &[
            "filesystem error",
            "EXT4-fs error",
            "XFS error",
            "I/O error",
            "file system corruption",
            "superblock corrupt",
            "metadata corruption",
            "fsck needed",
            "Buffer I/O error",
        ],
        AnomalyType::Oops => &[
            "Oops:",
            "general protection fault",
            "kernel BUG at",
            "Unable to handle kernel",
            "WARNING: CPU:",
            "BUG: unable to handle kernel",
            "invalid opcode:",
            "stack segment:",
        ],
        AnomalyType::Deadlock => &[
            "possible deadlock",
            "lock held",
            "blocked for",
            "stalled for",
            "hung task",
            "task blocked",
            "soft lockup",
            "hard lockup",
            "blocked for more than 120 seconds",
            "task hung",
            "Show Blocked State",
            "Call Trace for",
        ],
    }
}

/// Built-in regex inventory per anomaly type. Compiled case-insensitive.
fn builtin_patterns(t: AnomalyType) -> &'static [&'static str] {
    match t {
        AnomalyType::Oom => &[
            r"(?:Out\s+of\s+memory|OOM).*?(?:kill|terminat).*?process.*?\d+",
            r"oom.*?killer.*?invoked.*?(?:gfp_mask|order)=\w+",
            r"(?:Killed|terminated).*?process.*?\d+.*?(?:total-vm|rss).*?\d+[kKmMgG]?B",
            r"Memory.*?cgroup.*?out.*?memory.*?(?:usage|limit).*?\d+",
            r"oom_score.*?\d+.*?pid.*?\d+.*?total_vm.*?\d+",
            r"page allocation failure.*?order.*?\d+",
            r"compact.*?failed.*?order.*?\d+",
            r"swap.*?full.*?cannot.*?swap.*?out",
        ],
        AnomalyType::KernelPanic => &[
            r"(?:Kernel|kernel).*?panic.*?(?:not.*?syncing|System.*?halted)",
            r"panic.*?(?:CPU|PID).*?\d+.*?(?:not.*?syncing|System.*?halted)",
            r"(?:sysrq|SysRq).*?trigger.*?crash.*?Kernel.*?panic",
            r"(?:Unable to mount|Cannot mount).*?root.*?(?:filesystem|device)",
            r"(?:VFS|Virtual File System).*?mount.*?root.*?failed",
            r"end.*?Kernel.*?panic.*?(?:not.*?tty|sysrq)",
            r"BUG.*?unable.*?handle.*?(?:kernel|NULL).*?at.*?0x[\da-fA-F]+",
            r"general protection fault.*?ip:.*?[\da-fA-F]+.*?error:.*?\d+",
        ],
        AnomalyType::UnexpectedReboot => &[
            r"(?:unexpected|unclean).*?(?:shut.*?down|restart|reboot)",
            r"system.*?(?:reboot|restart).*?(?:initiated|triggered)",
            r"(?:watchdog|hardware).*?trigger.*?(?:reboot|restart)",
            r"power.*?(?:failure|loss).*?shut.*?down",
            r"ACPI.*?enter.*?(?:S5|shutdown|reboot)",
            r"systemd.*?reboot.*?target.*?start",
            r"kernel.*?restart.*?preparing",
            r"emergency.*?restart.*?initiated",
        ],
        AnomalyType::FsError => &[
            r"(?:filesystem|file system).*?error.*?(?:corrupt|damage)",
            r"(?:EXT4|XFS|BTRFS|NTFS).*?(?:error|corruption).*?detected",
            r"I/O.*?error.*?dev.*?\w+.*?(?:sector|logical).*?\d+",
            r"(?:superblock|metadata).*?corrupt.*?(?:run.*?fsck|repair)",
            r"Buffer.*?I/O.*?error.*?dev.*?\w+.*?logical.*?\d+",
            r"journal.*?abort.*?I/O.*?error",
            r"file.*?system.*?corruption.*?(?:detected|found)",
            r"fsck.*?needed.*?(?:filesystem|partition)",
            r"read.*?error.*?sector.*?\d+.*?device.*?\w+",
            r"write.*?error.*?sector.*?\d+.*?device.*?\w+",
        ],
        AnomalyType::Oops => &[
            r"Oops.*?(?:general protection|GPF).*?IP.*?[\da-fA-Fx]+",
            r"(?:kernel|Kernel).*?BUG.*?at.*?[\w/]+\.(?:c|h):\d+",
            r"(?:Unable to handle|Cannot handle).*?(?:kernel|NULL).*?pointer",
            r"WARNING.*?CPU.*?\d+.*?PID.*?\d+.*?at.*?[\w/]+",
            r"BUG.*?unable.*?handle.*?(?:kernel|page).*?fault",
            r"invalid.*?opcode.*?IP.*?[\da-fA-Fx]+",
            r"stack.*?segment.*?fault.*?address.*?[\da-fA-Fx]+",
            r"RIP.*?[\da-fA-Fx]+.*?Code.*?(?:Oops|BUG)",
            r"Call.*?Trace.*?(?:\[\w+\]|do_one_initcall)",
            r"divide.*?error.*?CPU.*?\d+.*?IP.*?[\da-fA-Fx]+",
        ],
        AnomalyType::Deadlock => &[
            r"(?:possible|potential).*?deadlock.*?(?:detected|found)",
            r"INFO.*?task.*?blocked.*?more.*?\d+.*?seconds",
            r"task.*?\w+.*?state.*?[RD].*?blocked.*?\d+.*?seconds",
            r"(?:soft|hard).*?lockup.*?CPU.*?\d+.*?stuck.*?\d+",
            r"hung.*?task.*?state.*?[RD].*?blocked",
            r"Show.*?Blocked.*?State.*?task.*?state.*?[RD]",
            r"Call.*?Trace.*?for.*?(?:mutex_lock|spin_lock)",
            r"detected.*?deadlock.*?between.*?\w+.*?and.*?\w+",
            r"lock.*?held.*?by.*?\w+.*?waiting.*?for.*?\w+",
            r"circular.*?dependency.*?detected.*?\w+.*?\w+",
        ],
    }
}

/// One enabled detector with its matching material prepared for scanning.
#[derive(Debug)]
struct Detector {
    anomaly_type: AnomalyType,
    /// Lowercased keywords for substring matching.
    keywords: Vec<String>,
    patterns: Vec<Regex>,
    mode: DetectionMode,
}

impl Detector {
    fn matches(&self, line_lower: &str, line: &str) -> bool {
        let keyword_hit = || self.keywords.iter().any(|k| line_lower.contains(k.as_str()));
        let regex_hit = || self.patterns.iter().any(|p| p.is_match(line));
        match self.mode {
            DetectionMode::Keyword => keyword_hit(),
            DetectionMode::Regex => regex_hit(),
            DetectionMode::Mixed => keyword_hit() || regex_hit(),
        }
    }
}

/// The enabled-detector set for one configuration snapshot.
#[derive(Debug)]
pub struct DetectorSet {
    detectors: Vec<Detector>,
}

impl DetectorSet {
    /// Build from the enabled-detector names and global mode, applying
    /// per-type overrides where present. Unknown names and invalid regex
    /// patterns are skipped with a warning; they never fail the build.
    pub fn build(
        enabled: &[String],
        mode: DetectionMode,
        overrides: Option<&std::collections::BTreeMap<String, DetectorOverride>>,
    ) -> Self {
        let mut detectors = Vec::new();
        for name in enabled {
            let Some(t) = AnomalyType::parse(name) else {
                tracing::warn!(detector = %name, "unknown detector name, skipping");
                continue;
            };
            let ov = overrides.and_then(|m| m.get(name.as_str()));
            if let Some(ov) = ov {
                if !ov.enabled {
                    continue;
                }
            }

            let mut keywords: Vec<String> = builtin_keywords(t)
                .iter()
                .map(|k| k.to_lowercase())
                .collect();
            let mut raw_patterns: Vec<String> =
                builtin_patterns(t).iter().map(|p| p.to_string()).collect();
            let mut det_mode = mode;
            if let Some(ov) = ov {
                if !ov.keywords.is_empty() {
                    keywords.extend(ov.keywords.iter().map(|k| k.to_lowercase()));
                }
                if !ov.regex_patterns.is_empty() {
                    raw_patterns.extend(ov.regex_patterns.iter().cloned());
                }
                if let Some(m) = ov.detection_mode {
                    det_mode = m;
                }
            }

            let patterns = raw_patterns
                .iter()
                .filter_map(|p| match compile_pattern(p) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        tracing::warn!(pattern = %p, %err, "invalid detector regex, skipping");
                        None
                    }
                })
                .collect();

            detectors.push(Detector {
                anomaly_type: t,
                keywords,
                patterns,
                mode: det_mode,
            });
        }
        DetectorSet { detectors }
    }

    /// Default set: all six detectors enabled, mixed mode, no overrides.
    pub fn all_mixed() -> Self {
        let enabled: Vec<String> = AnomalyType::ALL
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        Self::build(&enabled, DetectionMode::Mixed, None)
    }

    /// Classify one log line. Returns each matched type at most once;
    /// a line may match several types.
    pub fn classify(&self, line: &str) -> Vec<AnomalyType> {
        let line_lower = line.to_lowercase();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for det in &self.detectors {
            if seen.contains(&det.anomaly_type) {
                continue;
            }
            if det.matches(&line_lower, line) {
                seen.insert(det.anomaly_type);
                out.push(det.anomaly_type);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}
