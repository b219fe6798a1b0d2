use serde::{Deserialize, Serialize};

/// Guest architectures the harness can boot.
///
/// Each variant maps to the QEMU system emulator and machine parameters for
/// that target. Unknown architecture names fall back to the default rather
/// than failing: the harness's job is testing images, not validating build
/// targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestArch {
    #[default]
    #[serde(alias = "x86-64", alias = "amd64")]
    X86_64,
    #[serde(alias = "arm64")]
    Aarch64,
    Riscv64,
}

impl GuestArch {
    /// Parse an architecture name, falling back to the default for unknown
    /// values.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            "riscv64" => Self::Riscv64,
            other => {
                tracing::warn!(arch = other, "unknown guest architecture, using default");
                Self::default()
            }
        }
    }

    /// QEMU system emulator binary name.
    #[must_use]
    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Self::X86_64 => "qemu-system-x86_64",
            Self::Aarch64 => "qemu-system-aarch64",
            Self::Riscv64 => "qemu-system-riscv64",
        }
    }

    /// Machine type passed to `-machine`.
    #[must_use]
    pub fn machine_type(&self) -> &'static str {
        match self {
            Self::X86_64 => "q35",
            Self::Aarch64 => "virt",
            Self::Riscv64 => "virt",
        }
    }

    /// CPU model passed to `-cpu`.
    #[must_use]
    pub fn cpu_type(&self) -> &'static str {
        match self {
            Self::X86_64 => "qemu64",
            Self::Aarch64 => "cortex-a72",
            Self::Riscv64 => "rv64",
        }
    }

    /// Kernel command line fragment selecting the serial console device.
    #[must_use]
    pub fn console_boot_args(&self) -> &'static str {
        match self {
            Self::X86_64 => "console=ttyS0",
            Self::Aarch64 => "console=ttyAMA0",
            Self::Riscv64 => "console=ttyS0",
        }
    }
}

impl std::fmt::Display for GuestArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Riscv64 => write!(f, "riscv64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names() {
        assert_eq!(GuestArch::from_name("x86_64"), GuestArch::X86_64);
        assert_eq!(GuestArch::from_name("amd64"), GuestArch::X86_64);
        assert_eq!(GuestArch::from_name("AARCH64"), GuestArch::Aarch64);
        assert_eq!(GuestArch::from_name("arm64"), GuestArch::Aarch64);
        assert_eq!(GuestArch::from_name("riscv64"), GuestArch::Riscv64);
    }

    #[test]
    fn test_unknown_name_falls_back_to_default() {
        assert_eq!(GuestArch::from_name("sparc64"), GuestArch::default());
    }

    #[test]
    fn test_machine_parameters() {
        assert_eq!(GuestArch::X86_64.qemu_binary(), "qemu-system-x86_64");
        assert_eq!(GuestArch::X86_64.machine_type(), "q35");
        assert_eq!(GuestArch::Aarch64.machine_type(), "virt");
        assert_eq!(GuestArch::Aarch64.console_boot_args(), "console=ttyAMA0");
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&GuestArch::Aarch64).unwrap();
        assert_eq!(json, "\"aarch64\"");
        let back: GuestArch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, GuestArch::Aarch64);
    }
}
