//! Boundary to the external geoprocessing engine.
//!
//! Every geoprocessing operation is an opaque synchronous call: a module name,
//! typed parameters, single-letter flags and the overwrite switch. Successful
//! calls return the `key=value` lines the module printed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::process::Command;

use crate::config::EngineSettings;
use crate::error::EngineError;

/// Parsed `key=value` output of one engine command.
pub type EngineOutput = BTreeMap<String, String>;

// ── Commands ──────────────────────────────────────────────────────────────────

/// A parameter value passed to an engine module.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Int(i64),
    Float(f64),
    /// Small fixed-size sequences, rendered comma-separated.
    List(Vec<ParamValue>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self { ParamValue::Text(v.to_string()) }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self { ParamValue::Text(v) }
}

impl From<&String> for ParamValue {
    fn from(v: &String) -> Self { ParamValue::Text(v.clone()) }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self { ParamValue::Int(v) }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self { ParamValue::Int(v as i64) }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self { ParamValue::Float(v) }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self { ParamValue::List(v.into_iter().map(Into::into).collect()) }
}

/// One invocation of an engine module.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCommand {
    pub module: String,
    /// Parameters in insertion order.
    pub params: Vec<(String, ParamValue)>,
    /// Single-letter flags, e.g. `"b"` for `-b`.
    pub flags: String,
    pub overwrite: bool,
}

impl EngineCommand {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            params: Vec::new(),
            flags: String::new(),
            overwrite: false,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn flags(mut self, flags: &str) -> Self {
        self.flags.push_str(flags);
        self
    }

    /// Overwrite existing outputs. Derived products are always rewritten in
    /// place so re-runs never accumulate duplicates.
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn has_flag(&self, flag: char) -> bool {
        self.flags.contains(flag)
    }

    /// Command-line arguments following the module name.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !self.flags.is_empty() {
            args.push(format!("-{}", self.flags));
        }
        if self.overwrite {
            args.push("--overwrite".to_string());
        }
        args
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.module)?;
        for arg in self.to_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Parse `key=value` lines as printed by modules run with shell-style output
/// (`-g`). Lines without `=` are ignored; surrounding quotes are stripped.
pub fn parse_key_values(text: &str) -> EngineOutput {
    text.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            let v = v.trim().trim_matches(|c| c == '\'' || c == '"');
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

// ── Engine trait ──────────────────────────────────────────────────────────────

/// Kind of map stored in the engine database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapElement {
    Raster,
    Vector,
}

impl MapElement {
    /// Element name understood by `g.findfile`.
    pub fn element(self) -> &'static str {
        match self {
            MapElement::Raster => "cell",
            MapElement::Vector => "vector",
        }
    }

    /// Type name understood by `g.remove` and `g.copy`.
    pub fn type_name(self) -> &'static str {
        match self {
            MapElement::Raster => "raster",
            MapElement::Vector => "vector",
        }
    }
}

/// Synchronous command executor. Calls block until the module exits.
pub trait Engine {
    fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError>;

    /// Whether a map exists in the current search path.
    ///
    /// `g.findfile` exits with status 1 when the element is absent, which is
    /// an answer rather than a failure.
    fn exists(&mut self, element: MapElement, name: &str) -> Result<bool, EngineError> {
        let cmd = EngineCommand::new("g.findfile")
            .param("element", element.element())
            .param("file", name)
            .flags("n");
        match self.run(&cmd) {
            Ok(out) => Ok(out.get("name").is_some_and(|n| !n.is_empty())),
            Err(EngineError::CommandFailed { status: 1, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<E: Engine + ?Sized> Engine for &mut E {
    fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError> {
        (**self).run(command)
    }

    fn exists(&mut self, element: MapElement, name: &str) -> Result<bool, EngineError> {
        (**self).exists(element, name)
    }
}

// ── GRASS GIS ─────────────────────────────────────────────────────────────────

/// Runs modules through `grass <mapset path> --exec`.
pub struct GrassEngine {
    settings: EngineSettings,
}

impl GrassEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl Engine for GrassEngine {
    fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError> {
        tracing::debug!(command = %command, "engine call");

        let output = Command::new(&self.settings.executable)
            .arg(self.settings.mapset_path())
            .arg("--exec")
            .arg(&command.module)
            .args(command.to_args())
            .env("GRASS_OVERWRITE", if command.overwrite { "1" } else { "0" })
            .env("GRASS_VERBOSE", if self.settings.verbose { "1" } else { "0" })
            .env("GRASS_MESSAGE_FORMAT", "standard")
            .output()
            .map_err(|e| EngineError::Launch {
                module: command.module.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                module: command.module.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_key_values(&String::from_utf8_lossy(&output.stdout)))
    }
}

// ── Recording engine ──────────────────────────────────────────────────────────

/// Rule matching a command by module name and a substring of its rendering.
#[derive(Debug, Clone)]
struct Matcher {
    module: String,
    needle: String,
}

impl Matcher {
    fn matches(&self, command: &EngineCommand, rendered: &str) -> bool {
        command.module == self.module && rendered.contains(&self.needle)
    }
}

/// In-memory engine that records every command instead of executing it.
///
/// Backs `--dry-run` in the tools and the pipeline tests. Scripted responses
/// and failures are matched by module name plus a substring of the rendered
/// command. The mask state is tracked so callers can check that no mask is
/// left behind.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    log: Vec<EngineCommand>,
    responses: Vec<(Matcher, EngineOutput)>,
    failures: Vec<(Matcher, Option<usize>)>,
    maps: BTreeSet<(MapElement, String)>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `output` for commands of `module` whose rendering contains `needle`.
    pub fn respond(mut self, module: &str, needle: &str, output: &[(&str, &str)]) -> Self {
        let out = output
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.responses.push((
            Matcher { module: module.into(), needle: needle.into() },
            out,
        ));
        self
    }

    /// Fail every matching command.
    pub fn fail_on(mut self, module: &str, needle: &str) -> Self {
        self.failures
            .push((Matcher { module: module.into(), needle: needle.into() }, None));
        self
    }

    /// Fail only the first `times` matching commands.
    pub fn fail_times(mut self, module: &str, needle: &str, times: usize) -> Self {
        self.failures
            .push((Matcher { module: module.into(), needle: needle.into() }, Some(times)));
        self
    }

    /// Declare a map as already present.
    pub fn with_map(mut self, element: MapElement, name: &str) -> Self {
        self.maps.insert((element, name.to_string()));
        self
    }

    pub fn commands(&self) -> &[EngineCommand] {
        &self.log
    }

    /// Rendered command lines, in call order.
    pub fn rendered(&self) -> Vec<String> {
        self.log.iter().map(ToString::to_string).collect()
    }

    /// Number of recorded calls of `module`.
    pub fn count(&self, module: &str) -> usize {
        self.log.iter().filter(|c| c.module == module).count()
    }

    pub fn mask_active(&self) -> bool {
        self.maps.contains(&(MapElement::Raster, "MASK".to_string()))
    }

    pub fn has_map(&self, element: MapElement, name: &str) -> bool {
        self.maps.contains(&(element, name.to_string()))
    }

    fn apply_side_effects(&mut self, command: &EngineCommand) {
        match command.module.as_str() {
            "r.mask" if command.has_flag('r') => {
                self.maps.remove(&(MapElement::Raster, "MASK".to_string()));
            }
            "r.mask" => {
                self.maps.insert((MapElement::Raster, "MASK".to_string()));
            }
            "g.remove" => {
                let element = match command.get("type") {
                    Some(ParamValue::Text(t)) if t == "vector" => MapElement::Vector,
                    _ => MapElement::Raster,
                };
                if let Some(names) = command.get("name") {
                    for name in names.to_string().split(',') {
                        self.maps.remove(&(element, name.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
}

impl Engine for RecordingEngine {
    fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError> {
        let rendered = command.to_string();
        self.log.push(command.clone());

        for (matcher, remaining) in &mut self.failures {
            if !matcher.matches(command, &rendered) {
                continue;
            }
            match remaining {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(EngineError::CommandFailed {
                module: command.module.clone(),
                status: 1,
                stderr: format!("scripted failure for `{rendered}`"),
            });
        }

        self.apply_side_effects(command);

        let output = self
            .responses
            .iter()
            .find(|(m, _)| m.matches(command, &rendered))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(output)
    }

    fn exists(&mut self, element: MapElement, name: &str) -> Result<bool, EngineError> {
        Ok(self.maps.contains(&(element, name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_renders_params_flags_and_overwrite_in_order() {
        let cmd = EngineCommand::new("r.stream.extract")
            .param("elevation", "rio_gatun_elevation")
            .param("threshold", 1000u32)
            .param("memory", 12000i64)
            .flags("b")
            .overwrite();
        assert_eq!(
            cmd.to_string(),
            "r.stream.extract elevation=rio_gatun_elevation threshold=1000 memory=12000 -b --overwrite"
        );
    }

    #[test]
    fn list_params_render_comma_separated() {
        let cmd = EngineCommand::new("g.copy").param("vector", vec!["stations@PERMANENT", "stations"]);
        assert_eq!(cmd.to_args(), vec!["vector=stations@PERMANENT,stations"]);
    }

    #[test]
    fn parse_key_values_reads_univar_shell_output() {
        let text = "n=1200\nnull_cells=0\nmin=12.5\nmax=1024\nmean=433.25\nnot a pair\n";
        let out = parse_key_values(text);
        assert_eq!(out.get("min").map(String::as_str), Some("12.5"));
        assert_eq!(out.get("mean").map(String::as_str), Some("433.25"));
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn parse_key_values_strips_quotes_and_keeps_empty_values() {
        let out = parse_key_values("name=''\nmapset='PERMANENT'\n");
        assert_eq!(out.get("name").map(String::as_str), Some(""));
        assert_eq!(out.get("mapset").map(String::as_str), Some("PERMANENT"));
    }

    #[test]
    fn recording_engine_tracks_mask_state() {
        let mut engine = RecordingEngine::new();
        engine
            .run(&EngineCommand::new("r.mask").param("vector", "rio_gatun"))
            .unwrap();
        assert!(engine.mask_active());
        engine.run(&EngineCommand::new("r.mask").flags("r")).unwrap();
        assert!(!engine.mask_active());
        assert_eq!(engine.count("r.mask"), 2);
    }

    #[test]
    fn fail_times_only_fails_the_first_matches() {
        let mut engine = RecordingEngine::new().fail_times("r.mapcalc", "rio_gatun", 1);
        let cmd = EngineCommand::new("r.mapcalc").param("expression", "rio_gatun_elevation = elevation");
        assert!(engine.run(&cmd).is_err());
        assert!(engine.run(&cmd).is_ok());
    }

    #[test]
    fn default_exists_treats_status_one_as_absent() {
        struct Missing;
        impl Engine for Missing {
            fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError> {
                Err(EngineError::CommandFailed {
                    module: command.module.clone(),
                    status: 1,
                    stderr: String::new(),
                })
            }
        }
        assert_eq!(Missing.exists(MapElement::Raster, "MASK"), Ok(false));
    }
}
