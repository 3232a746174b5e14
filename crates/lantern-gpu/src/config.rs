//! Renderer configuration.

use crate::error::{GpuError, Result};

/// Settings read at context creation (validation, device) and on every
/// acquire (vsync, HDR).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer when available.
    pub validation: bool,
    /// Index into the ranked compatible device list. Out-of-range values fall
    /// back to the best device.
    pub preferred_device: usize,
    pub vsync: bool,
    pub hdr: bool,
    pub frames_in_flight: usize,
    /// Log allocator usage periodically and at shutdown.
    pub memory_stats: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            app_name: "Lantern".to_string(),
            validation: cfg!(debug_assertions),
            preferred_device: 0,
            vsync: true,
            hdr: false,
            frames_in_flight: 2,
            memory_stats: false,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GpuError::Config(format!("{name}: expected a boolean, got '{other}'"))),
    }
}

fn parse_index(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| GpuError::Config(format!("{name}: expected a device index, got '{value}'")))
}

impl GpuConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    pub fn with_preferred_device(mut self, index: usize) -> Self {
        self.preferred_device = index;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_hdr(mut self, hdr: bool) -> Self {
        self.hdr = hdr;
        self
    }

    pub fn with_memory_stats(mut self, enable: bool) -> Self {
        self.memory_stats = enable;
        self
    }

    /// Set the number of frame slots; at least one.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Apply `LANTERN_VALIDATION`, `LANTERN_DEVICE`, `LANTERN_VSYNC`,
    /// `LANTERN_HDR` and `LANTERN_MEM_STATS` from the process environment.
    pub fn from_env(self) -> Result<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply variables from `lookup`.
    pub fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("LANTERN_VALIDATION") {
            self.validation = parse_bool("LANTERN_VALIDATION", &value)?;
        }
        if let Some(value) = lookup("LANTERN_DEVICE") {
            self.preferred_device = parse_index("LANTERN_DEVICE", &value)?;
        }
        if let Some(value) = lookup("LANTERN_VSYNC") {
            self.vsync = parse_bool("LANTERN_VSYNC", &value)?;
        }
        if let Some(value) = lookup("LANTERN_HDR") {
            self.hdr = parse_bool("LANTERN_HDR", &value)?;
        }
        if let Some(value) = lookup("LANTERN_MEM_STATS") {
            self.memory_stats = parse_bool("LANTERN_MEM_STATS", &value)?;
        }
        Ok(self)
    }

    /// Apply command line flags and return the arguments left unconsumed.
    ///
    /// Recognized: `--validation`, `--no-validation`, `--device N`, `--vsync`,
    /// `--no-vsync`, `--hdr`, `--mem-stats`. The first item is treated as an
    /// ordinary argument, so pass `std::env::args().skip(1)`.
    pub fn apply_args<I>(&mut self, args: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut rest = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--validation" => self.validation = true,
                "--no-validation" => self.validation = false,
                "--vsync" => self.vsync = true,
                "--no-vsync" => self.vsync = false,
                "--hdr" => self.hdr = true,
                "--mem-stats" => self.memory_stats = true,
                "--device" => {
                    let value = args
                        .next()
                        .ok_or_else(|| GpuError::Config("--device: missing index".into()))?;
                    self.preferred_device = parse_index("--device", &value)?;
                }
                _ => {
                    if let Some(value) = arg.strip_prefix("--device=") {
                        self.preferred_device = parse_index("--device", value)?;
                    } else {
                        rest.push(arg);
                    }
                }
            }
        }
        Ok(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn flags_override_defaults_and_unknown_args_pass_through() {
        let mut config = GpuConfig::new("test").with_validation(false);
        let rest = config
            .apply_args(args(&["--device", "2", "--no-vsync", "--hdr", "--mem-stats", "--list-devices"]))
            .unwrap();
        assert_eq!(config.preferred_device, 2);
        assert!(!config.vsync);
        assert!(config.hdr);
        assert!(config.memory_stats);
        assert!(!config.validation);
        assert_eq!(rest, args(&["--list-devices"]));

        config.apply_args(args(&["--device=5", "--validation"])).unwrap();
        assert_eq!(config.preferred_device, 5);
        assert!(config.validation);
    }

    #[test]
    fn bad_device_index_is_rejected() {
        let mut config = GpuConfig::default();
        assert!(matches!(
            config.apply_args(args(&["--device", "first"])),
            Err(GpuError::Config(_))
        ));
        assert!(config.apply_args(args(&["--device"])).is_err());
    }

    #[test]
    fn environment_variables_apply() {
        let config = GpuConfig::default()
            .apply_vars(|name| match name {
                "LANTERN_VSYNC" => Some("off".into()),
                "LANTERN_HDR" => Some("1".into()),
                "LANTERN_DEVICE" => Some(" 1 ".into()),
                "LANTERN_MEM_STATS" => Some("yes".into()),
                _ => None,
            })
            .unwrap();
        assert!(config.memory_stats);
        assert!(!config.vsync);
        assert!(config.hdr);
        assert_eq!(config.preferred_device, 1);

        let err = GpuConfig::default()
            .apply_vars(|name| (name == "LANTERN_VALIDATION").then(|| "maybe".into()))
            .unwrap_err();
        assert!(err.to_string().contains("LANTERN_VALIDATION"));
    }

    #[test]
    fn frames_in_flight_is_at_least_one() {
        assert_eq!(GpuConfig::default().with_frames_in_flight(0).frames_in_flight, 1);
    }
}
