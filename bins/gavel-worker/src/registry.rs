// Language registry for the Gavel worker
//
// Toolchains are data, loaded from config/languages.json. The evaluator only
// ever sees the `LanguageRegistry` trait, so callers may plug in their own.
use gavel_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("language config file not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse languages config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown language '{0}' in languages config")]
    UnknownLanguage(String),
    #[error("no configuration found for language: {0}")]
    Unsupported(Language),
    #[error("unknown placeholder {{{placeholder}}} in command for {language}")]
    UnknownPlaceholder { language: String, placeholder: String },
}

/// A command line with `{source}`, `{artifact}`, `{dir}` and `{entry}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> Vec<String> {
        std::iter::once(&self.command)
            .chain(self.args.iter())
            .map(|part| vars.interpolate(part))
            .collect()
    }

    fn parts(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

/// Values substituted into command templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub source: String,
    pub artifact: String,
    pub dir: String,
    pub entry: String,
}

impl TemplateVars {
    const PLACEHOLDERS: [&'static str; 4] = ["source", "artifact", "dir", "entry"];

    pub fn interpolate(&self, template: &str) -> String {
        template
            .replace("{source}", &self.source)
            .replace("{artifact}", &self.artifact)
            .replace("{dir}", &self.dir)
            .replace("{entry}", &self.entry)
    }
}

/// Everything the core needs to know about one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Container image used by the Docker sandbox.
    #[serde(default)]
    pub image: String,
    /// Source file name inside the build workspace; may use `{entry}`.
    pub file_name: String,
    #[serde(default = "default_entry")]
    pub default_entry: String,
    #[serde(default)]
    pub compile: Option<CommandTemplate>,
    /// Optional fast load check for interpreted languages.
    #[serde(default)]
    pub syntax_check: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// CPUs granted to a container run.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
}

fn default_entry() -> String {
    "Main".to_string()
}

fn default_cpu_limit() -> f32 {
    1.0
}

impl LanguageSpec {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    pub fn file_extension(&self) -> &str {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
    }

    /// Source file name for a given entry point.
    pub fn source_file_name(&self, entry: &str) -> String {
        self.file_name.replace("{entry}", entry)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let templates = self
            .compile
            .iter()
            .chain(self.syntax_check.iter())
            .chain(std::iter::once(&self.run));
        for part in templates.flat_map(CommandTemplate::parts) {
            check_placeholders(&self.name, part)?;
        }
        Ok(())
    }
}

fn check_placeholders(language: &str, part: &str) -> Result<(), RegistryError> {
    let mut rest = part;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        if !TemplateVars::PLACEHOLDERS.contains(&name) {
            return Err(RegistryError::UnknownPlaceholder {
                language: language.to_string(),
                placeholder: name.to_string(),
            });
        }
        rest = &after[close + 1..];
    }
    Ok(())
}

/// Resolves a language to its toolchain description.
pub trait LanguageRegistry: Send + Sync {
    fn resolve(&self, language: Language) -> Result<&LanguageSpec, RegistryError>;

    fn languages(&self) -> Vec<Language>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageSpec>,
}

/// Registry backed by a languages.json file
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageSpec>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self, RegistryError> {
        if !config_path.exists() {
            return Err(RegistryError::NotFound(config_path.display().to_string()));
        }

        let content = fs::read_to_string(config_path).map_err(|source| RegistryError::Read {
            path: config_path.display().to_string(),
            source,
        })?;

        Self::from_json(&content)
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self, RegistryError> {
        Self::load(Path::new(DEFAULT_LANGUAGES_PATH))
    }

    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        Self::from_specs(languages_json.languages)
    }

    pub fn from_specs(specs: Vec<LanguageSpec>) -> Result<Self, RegistryError> {
        let mut configs = HashMap::new();
        for spec in specs {
            let language = spec
                .name
                .parse::<Language>()
                .map_err(|_| RegistryError::UnknownLanguage(spec.name.clone()))?;
            spec.validate()?;
            configs.insert(language, spec);
        }
        Ok(Self { configs })
    }

    /// The stock toolchain set written by `gavel-cli init`.
    pub fn builtin() -> Self {
        let specs = default_specs();
        let configs = specs
            .into_iter()
            .filter_map(|spec| spec.name.parse::<Language>().ok().map(|lang| (lang, spec)))
            .collect();
        Self { configs }
    }

    pub fn to_json_pretty(&self) -> Result<String, RegistryError> {
        let ordered: BTreeMap<Language, &LanguageSpec> =
            self.configs.iter().map(|(k, v)| (*k, v)).collect();
        let languages = ordered.into_values().cloned().collect();
        Ok(serde_json::to_string_pretty(&LanguagesJson { languages })?)
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

impl LanguageRegistry for LanguageConfigManager {
    fn resolve(&self, language: Language) -> Result<&LanguageSpec, RegistryError> {
        self.configs
            .get(&language)
            .ok_or(RegistryError::Unsupported(language))
    }

    fn languages(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.configs.keys().copied().collect();
        langs.sort();
        langs
    }
}

impl<R: LanguageRegistry + ?Sized> LanguageRegistry for Arc<R> {
    fn resolve(&self, language: Language) -> Result<&LanguageSpec, RegistryError> {
        (**self).resolve(language)
    }

    fn languages(&self) -> Vec<Language> {
        (**self).languages()
    }
}

fn spec(
    name: &str,
    image: &str,
    file_name: &str,
    compile: Option<CommandTemplate>,
    syntax_check: Option<CommandTemplate>,
    run: CommandTemplate,
) -> LanguageSpec {
    LanguageSpec {
        name: name.to_string(),
        version: "latest".to_string(),
        image: image.to_string(),
        file_name: file_name.to_string(),
        default_entry: default_entry(),
        compile,
        syntax_check,
        run,
        cpu_limit: default_cpu_limit(),
    }
}

fn default_specs() -> Vec<LanguageSpec> {
    vec![
        spec(
            "python",
            "python:3.12-slim",
            "main.py",
            None,
            Some(CommandTemplate::new("python3", &["-m", "py_compile", "{source}"])),
            CommandTemplate::new("python3", &["-u", "{source}"]),
        ),
        spec(
            "java",
            "eclipse-temurin:21",
            "{entry}.java",
            Some(CommandTemplate::new("javac", &["-d", "{dir}", "{source}"])),
            None,
            CommandTemplate::new("java", &["-cp", "{dir}", "{entry}"]),
        ),
        spec(
            "rust",
            "rust:1-slim",
            "main.rs",
            Some(CommandTemplate::new("rustc", &["-O", "-o", "{artifact}", "{source}"])),
            None,
            CommandTemplate::new("{artifact}", &[]),
        ),
        spec(
            "cpp",
            "gcc:13",
            "main.cpp",
            Some(CommandTemplate::new(
                "g++",
                &["-O2", "-std=c++17", "-o", "{artifact}", "{source}"],
            )),
            None,
            CommandTemplate::new("{artifact}", &[]),
        ),
        spec(
            "c",
            "gcc:13",
            "main.c",
            Some(CommandTemplate::new(
                "gcc",
                &["-O2", "-std=c11", "-o", "{artifact}", "{source}", "-lm"],
            )),
            None,
            CommandTemplate::new("{artifact}", &[]),
        ),
        spec(
            "javascript",
            "node:20-slim",
            "main.js",
            None,
            Some(CommandTemplate::new("node", &["--check", "{source}"])),
            CommandTemplate::new("node", &["{source}"]),
        ),
        spec(
            "go",
            "golang:1.22",
            "main.go",
            Some(CommandTemplate::new("go", &["build", "-o", "{artifact}", "{source}"])),
            None,
            CommandTemplate::new("{artifact}", &[]),
        ),
        spec(
            "bash",
            "bash:5",
            "main.sh",
            None,
            Some(CommandTemplate::new("bash", &["-n", "{source}"])),
            CommandTemplate::new("bash", &["{source}"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_language() {
        let registry = LanguageConfigManager::builtin();
        for lang in Language::ALL {
            assert!(registry.resolve(lang).is_ok(), "missing {}", lang);
        }
        assert!(registry.resolve(Language::Rust).unwrap().is_compiled());
        assert!(!registry.resolve(Language::Python).unwrap().is_compiled());
    }

    #[test]
    fn test_render_template() {
        let template = CommandTemplate::new("java", &["-cp", "{dir}", "{entry}"]);
        let vars = TemplateVars {
            dir: "/tmp/build".to_string(),
            entry: "Solution".to_string(),
            ..Default::default()
        };
        assert_eq!(template.render(&vars), vec!["java", "-cp", "/tmp/build", "Solution"]);
    }

    #[test]
    fn test_source_file_name_uses_entry() {
        let registry = LanguageConfigManager::builtin();
        let java = registry.resolve(Language::Java).unwrap();
        assert_eq!(java.source_file_name("Solution"), "Solution.java");
        assert_eq!(java.file_extension(), "java");
    }

    #[test]
    fn test_from_json_roundtrip() {
        let json = LanguageConfigManager::builtin().to_json_pretty().unwrap();
        let registry = LanguageConfigManager::from_json(&json).unwrap();
        assert_eq!(registry.list_languages().len(), Language::ALL.len());
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let json = r#"{"languages": [{
            "name": "python",
            "file_name": "main.py",
            "run": {"command": "python3", "args": ["{sauce}"]}
        }]}"#;
        let err = LanguageConfigManager::from_json(json).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPlaceholder { .. }));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let json = r#"{"languages": [{
            "name": "cobol",
            "file_name": "main.cob",
            "run": {"command": "cobc", "args": []}
        }]}"#;
        assert!(matches!(
            LanguageConfigManager::from_json(json),
            Err(RegistryError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = LanguageConfigManager::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_unsupported_language() {
        let registry = LanguageConfigManager::from_specs(vec![]).unwrap();
        assert!(matches!(
            registry.resolve(Language::Go),
            Err(RegistryError::Unsupported(Language::Go))
        ));
    }
}
