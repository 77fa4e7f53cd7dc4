//! Program catalog and environment resolution.
//!
//! Everything heuristic about a wrapped program lives here as data: how to
//! invoke it, which variants map to which flag, which output signatures mean
//! "ready for input", how long to wait before giving up on the signature, and
//! whether the program needs input pacing. The catalog is a replaceable
//! policy table — signature text drifts as the wrapped programs change their
//! own output, and tests substitute plain binaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ttymux_protocol::ProgramDescriptor;
use ttymux_protocol::VariantDescriptor;

/// Sentinel variant id meaning "no variant flag is appended".
pub const DEFAULT_VARIANT: &str = "default";

#[derive(Debug, Clone)]
pub struct ProgramVariant {
    pub id: String,
    pub name: String,
    /// Extra invocation tokens selecting this variant, e.g.
    /// `["--model", "opus"]`. Empty for the default sentinel.
    pub args: Vec<String>,
}

impl ProgramVariant {
    pub fn new(id: &str, name: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    fn default_variant() -> Self {
        Self::new(DEFAULT_VARIANT, "Default", &[])
    }
}

#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub id: String,
    pub name: String,
    /// Base invocation written to the hosting shell.
    pub command: String,
    /// Static arguments always appended to the invocation.
    pub args: Vec<String>,
    pub variants: Vec<ProgramVariant>,
    /// Lowercase substrings recognized in the de-escaped output stream as
    /// "ready for input".
    pub ready_signatures: Vec<String>,
    /// Ceiling on readiness latency when the signature is missed.
    pub readiness_fallback: Duration,
    /// Settle delay between spawning the shell and writing the invocation,
    /// avoiding races with shell initialization.
    pub startup_settle: Duration,
    /// Deliver large inputs in small paced chunks. Accommodation for
    /// programs known to mishandle big pasted blocks, not a general rule.
    pub paced_input: bool,
}

impl ProgramSpec {
    pub fn variant(&self, id: &str) -> Option<&ProgramVariant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Shell line that launches the program: base command, static args, and
    /// the variant tokens unless the variant is the `default` sentinel.
    pub fn invocation(&self, variant: &ProgramVariant) -> String {
        let mut tokens = Vec::with_capacity(1 + self.args.len() + variant.args.len());
        tokens.push(self.command.clone());
        tokens.extend(self.args.iter().cloned());
        if variant.id != DEFAULT_VARIANT {
            tokens.extend(variant.args.iter().cloned());
        }
        tokens.join(" ")
    }

    pub fn descriptor(&self) -> ProgramDescriptor {
        ProgramDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            variants: self
                .variants
                .iter()
                .map(|v| VariantDescriptor {
                    id: v.id.clone(),
                    name: v.name.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgramCatalog {
    programs: Vec<ProgramSpec>,
}

impl ProgramCatalog {
    pub fn new(programs: Vec<ProgramSpec>) -> Self {
        Self { programs }
    }

    /// The wrapped AI CLIs this service ships support for. Signature sets
    /// track the prompt chrome each program currently prints; they are data,
    /// expected to drift with upstream releases.
    pub fn builtin() -> Self {
        Self::new(vec![
            ProgramSpec {
                id: "claude".to_string(),
                name: "Claude Code".to_string(),
                command: "claude".to_string(),
                args: Vec::new(),
                variants: vec![
                    ProgramVariant::default_variant(),
                    ProgramVariant::new("opus", "Opus", &["--model", "opus"]),
                    ProgramVariant::new("sonnet", "Sonnet", &["--model", "sonnet"]),
                ],
                ready_signatures: vec![
                    "? for shortcuts".to_string(),
                    "esc to interrupt".to_string(),
                    "try \"".to_string(),
                ],
                readiness_fallback: Duration::from_secs(15),
                startup_settle: Duration::from_millis(800),
                paced_input: true,
            },
            ProgramSpec {
                id: "codex".to_string(),
                name: "Codex CLI".to_string(),
                command: "codex".to_string(),
                args: Vec::new(),
                variants: vec![
                    ProgramVariant::default_variant(),
                    ProgramVariant::new("gpt-5", "GPT-5", &["--model", "gpt-5"]),
                ],
                ready_signatures: vec![
                    "send a message".to_string(),
                    "ctrl+c to quit".to_string(),
                ],
                readiness_fallback: Duration::from_secs(12),
                startup_settle: Duration::from_millis(800),
                paced_input: false,
            },
            ProgramSpec {
                id: "gemini".to_string(),
                name: "Gemini CLI".to_string(),
                command: "gemini".to_string(),
                args: Vec::new(),
                variants: vec![
                    ProgramVariant::default_variant(),
                    ProgramVariant::new("flash", "Flash", &["--model", "gemini-flash"]),
                ],
                ready_signatures: vec![
                    "type your message".to_string(),
                    "gemini>".to_string(),
                ],
                readiness_fallback: Duration::from_secs(20),
                startup_settle: Duration::from_millis(800),
                paced_input: false,
            },
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ProgramSpec> {
        self.programs.iter().find(|p| p.id == id)
    }

    pub fn descriptors(&self) -> Vec<ProgramDescriptor> {
        self.programs.iter().map(ProgramSpec::descriptor).collect()
    }
}

/// Resolved child-process environment.
pub type EnvMap = HashMap<String, String>;

/// Strategy producing the environment a session process is spawned with.
/// Injectable so tests run without real login state on the host.
pub trait EnvResolver: Send + Sync {
    fn resolve(&self) -> EnvMap;
}

/// Default resolver: the child inherits the service's own environment, with
/// the configuration-search-path variables pointed at the service owner's
/// home so pre-existing login credentials of the wrapped programs are
/// visible, and browser auto-launch disabled for headless operation.
#[derive(Debug, Default)]
pub struct HostEnvResolver {
    home_override: Option<PathBuf>,
}

impl HostEnvResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home_override: Some(home),
        }
    }
}

impl EnvResolver for HostEnvResolver {
    fn resolve(&self) -> EnvMap {
        let mut env: EnvMap = std::env::vars().collect();
        let home = self
            .home_override
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        env.insert("HOME".to_string(), home.display().to_string());
        env.insert(
            "XDG_CONFIG_HOME".to_string(),
            home.join(".config").display().to_string(),
        );
        env.insert(
            "XDG_CACHE_HOME".to_string(),
            home.join(".cache").display().to_string(),
        );
        env.insert(
            "XDG_DATA_HOME".to_string(),
            home.join(".local/share").display().to_string(),
        );
        env.insert(
            "XDG_STATE_HOME".to_string(),
            home.join(".local/state").display().to_string(),
        );
        // `true` is a no-op command, so $BROWSER invocations succeed without
        // opening anything.
        env.insert("BROWSER".to_string(), "true".to_string());
        env
    }
}

/// Fixed-map resolver for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvResolver(pub EnvMap);

impl EnvResolver for StaticEnvResolver {
    fn resolve(&self) -> EnvMap {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_flag_is_skipped_for_default_sentinel() {
        let catalog = ProgramCatalog::builtin();
        let claude = catalog.get("claude").expect("claude in catalog");

        let default = claude.variant(DEFAULT_VARIANT).expect("default variant");
        assert_eq!(claude.invocation(default), "claude");

        let opus = claude.variant("opus").expect("opus variant");
        assert_eq!(claude.invocation(opus), "claude --model opus");
    }

    #[test]
    fn unknown_program_and_variant_lookups_fail() {
        let catalog = ProgramCatalog::builtin();
        assert!(catalog.get("emacs").is_none());
        let codex = catalog.get("codex").expect("codex in catalog");
        assert!(codex.variant("o3-mega").is_none());
    }

    #[test]
    fn host_resolver_points_search_paths_at_override_home() {
        let resolver = HostEnvResolver::with_home(PathBuf::from("/srv/ttymux-home"));
        let env = resolver.resolve();
        assert_eq!(env.get("HOME").map(String::as_str), Some("/srv/ttymux-home"));
        assert_eq!(
            env.get("XDG_CONFIG_HOME").map(String::as_str),
            Some("/srv/ttymux-home/.config")
        );
        assert_eq!(env.get("BROWSER").map(String::as_str), Some("true"));
    }

    #[test]
    fn descriptors_expose_catalog_shape() {
        let descriptors = ProgramCatalog::builtin().descriptors();
        assert_eq!(descriptors.len(), 3);
        let claude = &descriptors[0];
        assert_eq!(claude.id, "claude");
        assert!(claude.variants.iter().any(|v| v.id == "opus"));
    }
}
