use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{timeline::SegmentPlan, StemEditError};

/// The fixed catalog of edits the engine knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EditKind {
    Main,
    ClapIn,
    AcapIn,
    Extended,
    Short,
    Slam,
    AcapOut,
    ShortClapIn,
    ShortAcapIn,
    ShortAcapOut,
    AcapInAcapOut,
}

impl EditKind {
    /// Every edit in catalog order.
    pub const ALL: [EditKind; 11] = [
        EditKind::Main,
        EditKind::ClapIn,
        EditKind::AcapIn,
        EditKind::Extended,
        EditKind::Short,
        EditKind::Slam,
        EditKind::AcapOut,
        EditKind::ShortClapIn,
        EditKind::ShortAcapIn,
        EditKind::ShortAcapOut,
        EditKind::AcapInAcapOut,
    ];

    /// The edits generated for genres without a minimal policy.
    pub const FULL_CATALOG: [EditKind; 6] = [
        EditKind::Main,
        EditKind::ClapIn,
        EditKind::AcapIn,
        EditKind::Extended,
        EditKind::Short,
        EditKind::Slam,
    ];

    /// Human readable label, also embedded in titles and file names.
    pub fn label(self) -> &'static str {
        match self {
            EditKind::Main => "Main",
            EditKind::ClapIn => "Clap In",
            EditKind::AcapIn => "Acap In",
            EditKind::Extended => "Extended",
            EditKind::Short => "Short",
            EditKind::Slam => "Slam",
            EditKind::AcapOut => "Acap Out",
            EditKind::ShortClapIn => "Short Clap In",
            EditKind::ShortAcapIn => "Short Acap In",
            EditKind::ShortAcapOut => "Short Acap Out",
            EditKind::AcapInAcapOut => "Acap In Acap Out",
        }
    }
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EditKind {
    type Err = StemEditError;

    /// Accepts labels in any case, with spaces, dashes or underscores
    /// ("Clap In", "clap-in", "CLAP_IN", "clapin").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = compact(s);
        EditKind::ALL
            .into_iter()
            .find(|kind| compact(kind.label()) == wanted)
            .ok_or_else(|| StemEditError::UnknownEditType(s.to_string()))
    }
}

fn compact(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// A named edit together with the plan that builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSpec {
    pub kind: EditKind,
    pub plan: SegmentPlan,
}

impl EditSpec {
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}
