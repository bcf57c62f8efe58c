/// The two dash binaries this daemon knows how to place into the runtime's slot.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which known variant a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashType {
    /// The stock Oculus dash, identified by the absence of a custom product name.
    Normal,
    /// The SteamVR-launching replacement.
    OculusKiller,
}

impl fmt::Display for DashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DashType::Normal => f.write_str("normal"),
            DashType::OculusKiller => f.write_str("oculus-killer"),
        }
    }
}

/// Where a variant's binary is published: GitHub `repo/project`, release asset `asset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub repo: String,
    pub project: String,
    pub asset: String,
}

/// One candidate dash binary plus the runtime state derived from disk.
#[derive(Debug, Clone)]
pub struct DashVariant {
    pub kind: DashType,
    pub display_name: String,
    /// Stored file name inside the dash directory (never the slot name itself).
    pub file_name: String,
    /// ProductName version resource that marks this variant; empty for the stock dash.
    pub product_name: String,
    pub source: Option<RemoteSource>,
    /// Process asked to close before this variant is switched in.
    pub process_to_stop: Option<String>,

    pub installed: bool,
    pub active: bool,
    pub needs_update: bool,
    /// Byte length of the stored binary the last time it was inspected.
    pub current_size: Option<u64>,
    /// Release name of the stored binary, known once it was downloaded or
    /// matched against the latest release.
    pub current_version: Option<String>,
}

impl DashVariant {
    fn new(kind: DashType, display_name: &str, file_name: &str) -> Self {
        Self {
            kind,
            display_name: display_name.to_string(),
            file_name: file_name.to_string(),
            product_name: String::new(),
            source: None,
            process_to_stop: None,
            installed: false,
            active: false,
            needs_update: false,
            current_size: None,
            current_version: None,
        }
    }

    /// Official Oculus Dash, stored as `OculusDash_Normal.exe`. Closing SteamVR's
    /// monitor first keeps it from holding the slot open.
    pub fn normal() -> Self {
        Self {
            process_to_stop: Some("vrmonitor".to_string()),
            ..Self::new(DashType::Normal, "Official Oculus Dash", "OculusDash_Normal.exe")
        }
    }

    /// Oculus Killer, downloaded from its GitHub releases as `Oculus_Killer.exe`.
    pub fn oculus_killer() -> Self {
        Self {
            product_name: "Oculus Killer".to_string(),
            source: Some(RemoteSource {
                repo: "DevOculus-Meta-Quest".to_string(),
                project: "OculusKiller".to_string(),
                asset: "OculusDash.exe".to_string(),
            }),
            ..Self::new(
                DashType::OculusKiller,
                "DevOculus-Meta-Quest - Oculus Killer",
                "Oculus_Killer.exe",
            )
        }
    }

    /// True when `product_name` read from a binary identifies this variant.
    pub fn is_this_your_dash(&self, product_name: &str) -> bool {
        product_name == self.product_name
    }

    /// The default variant is the one identified by an empty product name.
    pub fn is_default(&self) -> bool {
        self.product_name.is_empty()
    }

    /// Display name, falling back to a placeholder when none was configured.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            "No Name Found"
        } else {
            &self.display_name
        }
    }
}

/// The fixed pair of known variants.
#[derive(Debug, Clone)]
pub struct DashRegistry {
    normal: DashVariant,
    oculus_killer: DashVariant,
}

impl DashRegistry {
    pub fn new() -> Self {
        Self {
            normal: DashVariant::normal(),
            oculus_killer: DashVariant::oculus_killer(),
        }
    }

    pub fn get(&self, kind: DashType) -> &DashVariant {
        match kind {
            DashType::Normal => &self.normal,
            DashType::OculusKiller => &self.oculus_killer,
        }
    }

    pub fn get_mut(&mut self, kind: DashType) -> &mut DashVariant {
        match kind {
            DashType::Normal => &mut self.normal,
            DashType::OculusKiller => &mut self.oculus_killer,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DashVariant> {
        [&self.normal, &self.oculus_killer].into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DashVariant> {
        [&mut self.normal, &mut self.oculus_killer].into_iter()
    }
}

impl Default for DashRegistry {
    fn default() -> Self {
        Self::new()
    }
}
