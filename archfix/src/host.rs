//! Host architecture detection.
//!
//! The answer always describes the machine this service runs on.
//! [`RequestOrigin`] only selects the detection strategy: a request from
//! a non-loopback address prefers the hardware-profile query, a local one
//! reads the kernel machine identifier. Nothing here inspects the remote
//! caller's own hardware.

use archfix_common::arch::Architecture;
use serde::Serialize;
use std::ffi::OsStr;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::tools::ToolRunner;

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    /// Loopback caller or in-process call.
    #[default]
    Local,
    /// Caller on another network address.
    Remote,
}

impl RequestOrigin {
    /// Classify a peer address.
    pub fn from_addr(addr: IpAddr) -> Self {
        if addr.is_loopback() {
            Self::Local
        } else {
            Self::Remote
        }
    }

    /// Map the request layer's boolean flag.
    pub fn from_remote_flag(is_remote: bool) -> Self {
        if is_remote { Self::Remote } else { Self::Local }
    }
}

/// Source of host introspection data.
pub trait HostProbe: Send + Sync {
    /// Kernel machine identifier, e.g. `x86_64` or `arm64`.
    fn machine(&self) -> io::Result<String>;

    /// Free-form hardware profile text.
    fn hardware_profile(&self) -> io::Result<String>;
}

/// [`HostProbe`] reading `uname(2)` and running the profiling tool.
pub struct SystemHost {
    runner: Arc<dyn ToolRunner>,
    system_profiler: PathBuf,
}

impl SystemHost {
    /// Probe using `runner` to invoke `system_profiler`.
    pub fn new(runner: Arc<dyn ToolRunner>, system_profiler: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            system_profiler: system_profiler.into(),
        }
    }
}

impl HostProbe for SystemHost {
    fn machine(&self) -> io::Result<String> {
        let uts = nix::sys::utsname::uname().map_err(io::Error::from)?;
        Ok(uts.machine().to_string_lossy().into_owned())
    }

    fn hardware_profile(&self) -> io::Result<String> {
        let output = self
            .runner
            .run(&self.system_profiler, &[OsStr::new("SPHardwareDataType")])?;
        if !output.success() {
            return Err(io::Error::other(format!(
                "{} exited with {:?}",
                self.system_profiler.display(),
                output.code
            )));
        }
        Ok(output.stdout)
    }
}

/// Architecture implied by a hardware profile, if recognizable.
///
/// An integrated Apple chip means arm64; an Intel processor means x86_64.
pub fn profile_architecture(profile: &str) -> Architecture {
    let lower = profile.to_lowercase();
    if lower.contains("chip") && lower.contains("apple") {
        Architecture::Arm64
    } else if lower.contains("intel") {
        Architecture::X86_64
    } else {
        Architecture::Unknown
    }
}

fn machine_architecture(probe: &dyn HostProbe) -> Architecture {
    match probe.machine() {
        Ok(machine) => {
            let arch = Architecture::from_machine(&machine);
            debug!(%machine, %arch, "Host machine identifier");
            arch
        }
        Err(e) => {
            warn!("Could not read host machine identifier: {e}");
            Architecture::Unknown
        }
    }
}

/// Detect the host architecture using the strategy for `origin`.
pub fn host_architecture(probe: &dyn HostProbe, origin: RequestOrigin) -> Architecture {
    if origin == RequestOrigin::Local {
        return machine_architecture(probe);
    }

    match probe.hardware_profile() {
        Ok(profile) => match profile_architecture(&profile) {
            Architecture::Unknown => {
                debug!("Hardware profile unrecognized, falling back to machine identifier");
                machine_architecture(probe)
            }
            arch => arch,
        },
        Err(e) => {
            warn!("Error getting hardware profile: {e}");
            machine_architecture(probe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct FakeHost {
        machine: &'static str,
        profile: Option<&'static str>,
    }

    impl HostProbe for FakeHost {
        fn machine(&self) -> io::Result<String> {
            Ok(self.machine.to_string())
        }

        fn hardware_profile(&self) -> io::Result<String> {
            self.profile
                .map(str::to_string)
                .ok_or_else(|| io::Error::other("system_profiler missing"))
        }
    }

    #[test]
    fn test_origin_from_addr() {
        assert_eq!(
            RequestOrigin::from_addr(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            RequestOrigin::Local
        );
        assert_eq!(
            RequestOrigin::from_addr(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            RequestOrigin::Local
        );
        assert_eq!(
            RequestOrigin::from_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
            RequestOrigin::Remote
        );
    }

    #[test]
    fn test_local_ignores_profile() {
        let host = FakeHost {
            machine: "x86_64",
            profile: Some("Chip: Apple M2"),
        };
        assert_eq!(host_architecture(&host, RequestOrigin::Local), Architecture::X86_64);
    }

    #[test]
    fn test_remote_uses_profile_vendor() {
        let apple = FakeHost {
            machine: "x86_64",
            profile: Some("Hardware Overview:\n  Chip: Apple M1 Pro\n"),
        };
        assert_eq!(host_architecture(&apple, RequestOrigin::Remote), Architecture::Arm64);

        let intel = FakeHost {
            machine: "arm64",
            profile: Some("Processor Name: Quad-Core Intel Core i7"),
        };
        assert_eq!(host_architecture(&intel, RequestOrigin::Remote), Architecture::X86_64);
    }

    #[test]
    fn test_remote_falls_back_to_machine() {
        let failing = FakeHost {
            machine: "aarch64",
            profile: None,
        };
        assert_eq!(host_architecture(&failing, RequestOrigin::Remote), Architecture::Arm64);

        let unrecognized = FakeHost {
            machine: "sparc64",
            profile: Some("Model Name: Mystery Box"),
        };
        assert_eq!(
            host_architecture(&unrecognized, RequestOrigin::Remote),
            Architecture::Unknown
        );
    }
}
