//! Tasmota topic routing
//!
//! Two topic layouts are understood:
//! - `<prefix>/<device>/<suffix>` (Tasmota's default full topic)
//! - `tasmota/<device>/<prefix>/<suffix>`
//!
//! Anything else is a generic topic whose device key is the topic itself.

/// Tasmota message prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Tele,
    Stat,
    Cmnd,
}

impl Prefix {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tele" => Some(Self::Tele),
            "stat" => Some(Self::Stat),
            "cmnd" => Some(Self::Cmnd),
            _ => None,
        }
    }
}

/// A parsed Tasmota topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TasmotaTopic<'a> {
    pub prefix: Prefix,
    pub device: &'a str,
    pub suffix: String,
}

impl<'a> TasmotaTopic<'a> {
    /// Parse either topic layout
    #[must_use]
    pub fn parse(topic: &'a str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["tasmota", device, prefix, rest @ ..] if !rest.is_empty() => Some(Self {
                prefix: Prefix::parse(prefix)?,
                device: *device,
                suffix: rest.join("/"),
            }),
            [prefix, device, rest @ ..] if !rest.is_empty() => Some(Self {
                prefix: Prefix::parse(prefix)?,
                device: *device,
                suffix: rest.join("/"),
            }),
            _ => None,
        }
    }
}

/// What a bus message means for the device layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    /// Online/offline last-will
    Lwt { device: &'a str },
    /// Full status reply (name, network, firmware)
    Status0 { device: &'a str },
    /// Periodic state, sensor telemetry or command result
    Telemetry { device: &'a str },
    /// A non-Tasmota topic, tracked as a device keyed by the full topic
    Generic { topic: &'a str },
    /// Nothing to do (own command echoes, discovery config, unknown suffixes)
    Ignore,
}

/// Classify a topic
#[must_use]
pub fn route(topic: &str) -> Route<'_> {
    if topic.starts_with("tasmota/discovery/") {
        return Route::Ignore;
    }

    let Some(parsed) = TasmotaTopic::parse(topic) else {
        return Route::Generic { topic };
    };

    match (parsed.prefix, parsed.suffix.as_str()) {
        (Prefix::Tele, "LWT") => Route::Lwt {
            device: parsed.device,
        },
        (Prefix::Stat, "STATUS0") => Route::Status0 {
            device: parsed.device,
        },
        (Prefix::Tele, "STATE" | "SENSOR") | (Prefix::Stat, "RESULT") => Route::Telemetry {
            device: parsed.device,
        },
        _ => Route::Ignore,
    }
}
