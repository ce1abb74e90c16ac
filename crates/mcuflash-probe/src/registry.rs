//! Probe registry and session opening
//!
//! Probes are opened by a specification string of the form `name` or
//! `name:key1=value1,key2=value2`. The registry is an ordinary value built
//! by the caller; nothing is registered globally.

use std::collections::HashMap;
use std::sync::Arc;

use mcuflash_core::config::EngineConfig;
use mcuflash_core::family::FamilyDatabase;
use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;

use crate::error::ProbeError;

/// A probe behind dynamic dispatch, as handed out by the registry
pub type BoxedProbe = Box<dyn DebugProbe + Send>;

/// Opens one kind of probe from its parameters
pub type OpenFn =
    Box<dyn Fn(&ProbeParams, &FamilyDatabase) -> Result<BoxedProbe, ProbeError> + Send + Sync>;

/// Parsed probe parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeParams {
    /// Probe name as given
    pub name: String,
    /// Key-value parameters
    pub params: HashMap<String, String>,
}

impl ProbeParams {
    /// Parameter value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Parse a probe string into name and parameters
///
/// Format: "name" or "name:key1=value1,key2=value2"
///
/// # Example
/// ```ignore
/// let params = parse_probe_params("sim:family=stm32h7")?;
/// assert_eq!(params.name, "sim");
/// assert_eq!(params.get("family"), Some("stm32h7"));
/// ```
pub fn parse_probe_params(s: &str) -> Result<ProbeParams, ProbeError> {
    let (name, opts_str) = s.split_once(':').unwrap_or((s, ""));
    if name.is_empty() {
        return Err(ProbeError::InvalidParameter("empty probe name".into()));
    }

    let mut params = HashMap::new();
    if !opts_str.is_empty() {
        for opt in opts_str.split(',') {
            match opt.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    params.insert(key.to_string(), value.to_string());
                }
                _ => {
                    return Err(ProbeError::InvalidParameter(format!(
                        "'{}' (expected key=value)",
                        opt
                    )));
                }
            }
        }
    }

    Ok(ProbeParams {
        name: name.to_string(),
        params,
    })
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_number(s: &str) -> Result<u32, ProbeError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ProbeError::InvalidParameter(format!("'{}' is not a number", s)))
}

/// Description of a registered probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Canonical name
    pub name: &'static str,
    /// Alternative names
    pub aliases: &'static [&'static str],
    /// One-line description including the accepted parameters
    pub description: &'static str,
}

impl ProbeInfo {
    fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

struct Entry {
    info: ProbeInfo,
    open: OpenFn,
}

/// Set of probes that can be opened by name
#[derive(Default)]
pub struct ProbeRegistry {
    entries: Vec<Entry>,
}

impl ProbeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every probe driver compiled in
    #[allow(unused_mut)]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "sim")]
        registry.register(crate::sim::INFO, Box::new(crate::sim::open));

        registry
    }

    /// Add a probe; a later registration under the same name wins
    pub fn register(&mut self, info: ProbeInfo, open: OpenFn) {
        self.entries.retain(|e| e.info.name != info.name);
        self.entries.push(Entry { info, open });
    }

    /// Registered probes, in registration order
    pub fn list(&self) -> impl Iterator<Item = &ProbeInfo> {
        self.entries.iter().map(|e| &e.info)
    }

    /// Comma-separated probe names for help texts
    pub fn names_short(&self) -> String {
        if self.entries.is_empty() {
            return "none (recompile with features)".to_string();
        }
        let names: Vec<&str> = self.list().map(|p| p.name).collect();
        names.join(", ")
    }

    /// Open a probe from its specification string
    pub fn open(&self, spec: &str, db: &FamilyDatabase) -> Result<BoxedProbe, ProbeError> {
        let params = parse_probe_params(spec)?;
        let entry = self
            .entries
            .iter()
            .find(|e| e.info.matches(&params.name))
            .ok_or_else(|| ProbeError::UnknownProbe(params.name.clone()))?;

        log::info!("Opening {} probe...", entry.info.name);
        (entry.open)(&params, db)
    }

    /// Open a probe and attach to its target
    ///
    /// # Example
    /// ```ignore
    /// let registry = ProbeRegistry::with_defaults();
    /// let db = Arc::new(FamilyDatabase::builtin()?);
    /// let mut session = registry.open_session("sim", db, EngineConfig::default())?;
    /// println!("{}", session.info());
    /// ```
    pub fn open_session(
        &self,
        spec: &str,
        db: Arc<FamilyDatabase>,
        config: EngineConfig,
    ) -> Result<Session<BoxedProbe>, ProbeError> {
        let probe = self.open(spec, &db)?;
        Ok(Session::attach(probe, db, config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_params() {
        let params = parse_probe_params("sim:family=stm32h7,link=survives").unwrap();
        assert_eq!(params.name, "sim");
        assert_eq!(params.get("family"), Some("stm32h7"));
        assert_eq!(params.get("link"), Some("survives"));
        assert_eq!(params.params.len(), 2);

        let params = parse_probe_params("sim").unwrap();
        assert_eq!(params.name, "sim");
        assert!(params.params.is_empty());

        let params = parse_probe_params("sim:").unwrap();
        assert!(params.params.is_empty());
    }

    #[test]
    fn test_parse_probe_params_invalid() {
        assert!(matches!(
            parse_probe_params("sim:family"),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(matches!(
            parse_probe_params("sim:=x"),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(matches!(
            parse_probe_params(":family=x"),
            Err(ProbeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42").unwrap(), 42);
        assert_eq!(parse_number("0xAA").unwrap(), 0xAA);
        assert_eq!(parse_number("0X10").unwrap(), 16);
        assert!(parse_number("zz").is_err());
    }

    #[test]
    fn test_unknown_probe() {
        let registry = ProbeRegistry::new();
        let db = FamilyDatabase::new();
        assert!(matches!(
            registry.open("stlink", &db),
            Err(ProbeError::UnknownProbe(name)) if name == "stlink"
        ));
        assert_eq!(registry.names_short(), "none (recompile with features)");
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ProbeRegistry::new();
        let info = ProbeInfo {
            name: "fake",
            aliases: &["f"],
            description: "first",
        };
        registry.register(
            info.clone(),
            Box::new(|_, _| Err(ProbeError::Open("first".into()))),
        );
        registry.register(
            ProbeInfo {
                description: "second",
                ..info
            },
            Box::new(|_, _| Err(ProbeError::Open("second".into()))),
        );

        assert_eq!(registry.list().count(), 1);
        assert_eq!(registry.names_short(), "fake");
        let db = FamilyDatabase::new();
        assert!(matches!(
            registry.open("f", &db),
            Err(ProbeError::Open(reason)) if reason == "second"
        ));
    }
}
