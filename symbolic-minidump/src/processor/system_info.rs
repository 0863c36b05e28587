use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use symbolic_common::Arch;

lazy_static! {
    static ref LINUX_BUILD_RE: Regex =
        Regex::new(r"^Linux ([^ ]+) (.*) \w+(?: GNU/Linux)?$").unwrap();
}

/// Information about the CPU and OS on which a minidump was generated.
#[derive(Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SystemInfo {
    pub(crate) os_name: String,
    pub(crate) os_version: String,
    pub(crate) os_build: String,
    pub(crate) cpu_family: String,
    pub(crate) cpu_info: String,
    pub(crate) cpu_count: u32,
}

impl SystemInfo {
    /// Creates system information for the given CPU architecture.
    ///
    /// The operating system is left empty and can be set with [`with_os`](Self::with_os).
    pub fn new(arch: Arch) -> Self {
        SystemInfo {
            os_version: "0.0.0".into(),
            cpu_family: cpu_family_name(arch).into(),
            cpu_count: 1,
            ..SystemInfo::default()
        }
    }

    /// Sets the operating system name, version and build.
    pub fn with_os(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        build: impl Into<String>,
    ) -> Self {
        self.os_name = name.into();
        self.os_version = version.into();
        self.os_build = build.into();
        self
    }

    /// Sets the CPU vendor description and the number of processors.
    pub fn with_cpu_info(mut self, info: impl Into<String>, count: u32) -> Self {
        self.cpu_info = info.into();
        self.cpu_count = count;
        self
    }

    /// A string identifying the operating system, such as "Windows NT", "Mac OS X", or "Linux".
    ///
    /// If the information is present in the dump but its value is unknown, this field will contain
    /// a numeric value.  If the information is not present in the dump, this field will be empty.
    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// Strings identifying the version and build number of the operating system.
    ///
    /// If the dump does not contain either information, the component will be empty. Tries to parse
    /// the version number from the build if it is not apparent from the version string.
    pub fn os_parts(&self) -> (String, String) {
        let version = match self.os_version.as_str() {
            "" => "0.0.0",
            version => version,
        };

        if version == "0.0.0" {
            // Try to parse the Linux build string. Breakpad and Crashpad run
            // `uname -srvmo` to generate it. This roughly resembles:
            // "Linux [version] [build...] [arch] Linux/GNU"
            if let Some(captures) = LINUX_BUILD_RE.captures(&self.os_build) {
                if let (Some(version), Some(build)) = (captures.get(1), captures.get(2)) {
                    return (version.as_str().into(), build.as_str().into());
                }
            }
        }

        (version.into(), self.os_build.clone())
    }

    /// A string identifying the version of the operating system.
    ///
    /// The version will be formatted as three-component semantic version, such as "5.1.2600" or
    /// "10.4.8".  If the dump does not contain this information, this field will contain "0.0.0".
    pub fn os_version(&self) -> String {
        self.os_parts().0
    }

    /// A string identifying the build of the operating system.
    ///
    /// This build version is platform dependent, such as "Service Pack 2" or "8L2127".  If the dump
    /// does not contain this information, this field will be empty.
    pub fn os_build(&self) -> String {
        self.os_parts().1
    }

    /// A string identifying the basic CPU family, such as "x86" or "ppc".
    ///
    /// If this information is present in the dump but its value is unknown,
    /// this field will contain a numeric value.  If the information is not
    /// present in the dump, this field will be empty.
    pub fn cpu_family(&self) -> &str {
        &self.cpu_family
    }

    /// The architecture of the CPU parsed from `cpu_family`.
    ///
    /// If this information is present in the dump but its value is unknown
    /// or if the value is missing, this field will contain `Arch::Unknown`.
    pub fn cpu_arch(&self) -> Arch {
        self.cpu_family.parse().unwrap_or_default()
    }

    /// A string further identifying the specific CPU.
    ///
    /// This information depends on the CPU vendor, such as "GenuineIntel level 6 model 13 stepping
    /// 8". If the information is not present in the dump, or additional identifying information is
    /// not defined for the CPU family, this field will be empty.
    pub fn cpu_info(&self) -> &str {
        &self.cpu_info
    }

    /// The number of processors in the system.
    ///
    /// Will be greater than one for multi-core systems.
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }
}

impl fmt::Debug for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemInfo")
            .field("os_name", &self.os_name())
            .field("os_version", &self.os_version())
            .field("os_build", &self.os_build())
            .field("cpu_family", &self.cpu_family())
            .field("cpu_info", &self.cpu_info())
            .field("cpu_count", &self.cpu_count())
            .finish()
    }
}

/// Returns the Breakpad name of the CPU family of an architecture.
fn cpu_family_name(arch: Arch) -> &'static str {
    use symbolic_common::CpuFamily;

    match arch.cpu_family() {
        CpuFamily::Intel32 => "x86",
        CpuFamily::Amd64 => "amd64",
        CpuFamily::Arm32 => "arm",
        CpuFamily::Arm64 => "arm64",
        CpuFamily::Arm64_32 => "arm64_32",
        CpuFamily::Ppc32 => "ppc",
        CpuFamily::Ppc64 => "ppc64",
        CpuFamily::Mips32 => "mips",
        CpuFamily::Mips64 => "mips64",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_linux_build_parsing() {
        let info = SystemInfo::new(Arch::Amd64).with_os(
            "Linux",
            "0.0.0",
            "Linux 4.15.0-1036-gcp #38-Ubuntu SMP Mon Jun 3 20:16:52 UTC 2019 x86_64",
        );

        assert_eq!(info.os_version(), "4.15.0-1036-gcp");
        assert_eq!(info.os_build(), "#38-Ubuntu SMP Mon Jun 3 20:16:52 UTC 2019");
    }

    #[test]
    fn test_gnu_linux_suffix() {
        let info = SystemInfo::new(Arch::Arm64).with_os(
            "Linux",
            "",
            "Linux 5.10.0 #1 SMP PREEMPT aarch64 GNU/Linux",
        );

        assert_eq!(info.os_parts(), ("5.10.0".into(), "#1 SMP PREEMPT".into()));
    }

    #[test]
    fn test_explicit_version_wins() {
        let info = SystemInfo::new(Arch::X86).with_os("Windows NT", "10.0.19041", "Service Pack 2");

        assert_eq!(info.os_version(), "10.0.19041");
        assert_eq!(info.os_build(), "Service Pack 2");
    }

    #[test]
    fn test_cpu_arch() {
        assert_eq!(SystemInfo::new(Arch::Amd64).cpu_family(), "amd64");
        assert_eq!(SystemInfo::new(Arch::Amd64).cpu_arch(), Arch::Amd64);
        assert_eq!(SystemInfo::new(Arch::ArmV7).cpu_arch(), Arch::Arm);
        assert_eq!(SystemInfo::default().cpu_arch(), Arch::Unknown);
    }
}
