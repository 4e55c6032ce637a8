//! Per-language source layout and compile/run commands.
//!
//! Every supported language registers one [`Preparator`] in the process-wide
//! registry. The registry is built once, on first use, and is read-only
//! afterwards. Adding a language means adding a preparator and a
//! `register` call in [`Registry::builtin`].

use mycode_common::types::Language;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("unknown language: {0}")]
    UnknownLanguage(Language),
    #[error("make source directory {path}: {source}")]
    SourceDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write source file {path}: {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read source directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no compiled artifact found in {0}")]
    NoArtifact(PathBuf),
}

/// Prepared source, ready to be compiled and run
pub trait Recipe: Send {
    /// Directory holding the source; compile and run happen inside it
    fn source_path(&self) -> &Path;

    /// Extra read-only paths the run command needs inside the isolator
    fn extra_binds(&self) -> &[String];

    /// Empty when the language is not compiled
    fn compile_command(&self) -> &[String];

    /// Resolved after compilation, since some artifacts are only known then
    fn run_command(&self) -> Result<Vec<String>, PrepareError>;
}

pub trait Preparator: Send + Sync {
    /// Lays the source out under `root` and returns its recipe
    fn prepare(&self, root: &Path, source: &str) -> Result<Box<dyn Recipe>, PrepareError>;
}

fn write_source(dir: &Path, file_name: &str, source: &str) -> Result<(), PrepareError> {
    fs::create_dir_all(dir).map_err(|source| PrepareError::SourceDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(file_name);
    fs::write(&path, source).map_err(|source| PrepareError::SourceFile { path, source })
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Language whose binary name is known before compiling
pub struct FixedCommands {
    pub source_dir: &'static str,
    pub file_name: &'static str,
    pub compile: &'static [&'static str],
    pub run: &'static [&'static str],
    pub extra_binds: &'static [&'static str],
}

struct FixedRecipe {
    source_path: PathBuf,
    extra_binds: Vec<String>,
    compile: Vec<String>,
    run: Vec<String>,
}

impl Recipe for FixedRecipe {
    fn source_path(&self) -> &Path {
        &self.source_path
    }

    fn extra_binds(&self) -> &[String] {
        &self.extra_binds
    }

    fn compile_command(&self) -> &[String] {
        &self.compile
    }

    fn run_command(&self) -> Result<Vec<String>, PrepareError> {
        Ok(self.run.clone())
    }
}

impl Preparator for FixedCommands {
    fn prepare(&self, root: &Path, source: &str) -> Result<Box<dyn Recipe>, PrepareError> {
        let source_path = root.join(self.source_dir);
        write_source(&source_path, self.file_name, source)?;
        Ok(Box::new(FixedRecipe {
            source_path,
            extra_binds: args(self.extra_binds),
            compile: args(self.compile),
            run: args(self.run),
        }))
    }
}

const JAVA_HOME_BIN: &str = "/usr/lib/jvm/java-11-openjdk/bin";
const CLASS_SUFFIX: &str = ".class";

/// Java: the class to run is named by the source, so it is found by
/// scanning the compiled output for a class file.
pub struct JavaClassDiscovery;

struct JavaRecipe {
    source_path: PathBuf,
    compile: Vec<String>,
}

impl Recipe for JavaRecipe {
    fn source_path(&self) -> &Path {
        &self.source_path
    }

    fn extra_binds(&self) -> &[String] {
        &[]
    }

    fn compile_command(&self) -> &[String] {
        &self.compile
    }

    fn run_command(&self) -> Result<Vec<String>, PrepareError> {
        let entries = fs::read_dir(&self.source_path).map_err(|source| PrepareError::ReadDir {
            path: self.source_path.clone(),
            source,
        })?;

        let mut classes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PrepareError::ReadDir {
                path: self.source_path.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(class) = name.strip_suffix(CLASS_SUFFIX) {
                classes.push(class.to_string());
            }
        }

        // Nested and helper classes compile to their own files; prefer Main.
        classes.sort();
        let class = match classes.iter().position(|c| c == "Main") {
            Some(idx) => classes.swap_remove(idx),
            None if !classes.is_empty() => classes.swap_remove(0),
            None => return Err(PrepareError::NoArtifact(self.source_path.clone())),
        };

        Ok(vec![format!("{}/java", JAVA_HOME_BIN), class])
    }
}

impl Preparator for JavaClassDiscovery {
    fn prepare(&self, root: &Path, source: &str) -> Result<Box<dyn Recipe>, PrepareError> {
        let source_path = root.join("java");
        write_source(&source_path, "main.java", source)?;
        Ok(Box::new(JavaRecipe {
            source_path,
            compile: vec![format!("{}/javac", JAVA_HOME_BIN), "main.java".to_string()],
        }))
    }
}

pub struct Registry {
    preparators: HashMap<Language, Box<dyn Preparator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            preparators: HashMap::new(),
        }
    }

    pub fn register(&mut self, language: Language, preparator: Box<dyn Preparator>) {
        self.preparators.insert(language, preparator);
    }

    pub fn builtin() -> Self {
        let mut registry = Registry::new();
        registry.register(
            Language::C,
            Box::new(FixedCommands {
                source_dir: "c",
                file_name: "main.c",
                compile: &["gcc", "main.c"],
                run: &["./a.out"],
                extra_binds: &[],
            }),
        );
        registry.register(
            Language::Cpp,
            Box::new(FixedCommands {
                source_dir: "cpp",
                file_name: "main.cpp",
                compile: &["g++", "main.cpp"],
                run: &["./a.out"],
                extra_binds: &[],
            }),
        );
        registry.register(
            Language::Go,
            Box::new(FixedCommands {
                source_dir: "go/src/app",
                file_name: "main.go",
                compile: &["go", "build", "main.go"],
                run: &["./main"],
                extra_binds: &[],
            }),
        );
        registry.register(Language::Java, Box::new(JavaClassDiscovery));
        registry.register(
            Language::Pascal,
            Box::new(FixedCommands {
                source_dir: "pascal",
                file_name: "main.pas",
                compile: &["fpc", "main.pas"],
                run: &["./main"],
                extra_binds: &[],
            }),
        );
        registry.register(
            Language::Python,
            Box::new(FixedCommands {
                source_dir: "python",
                file_name: "main.py",
                compile: &[],
                run: &["python3", "main.py"],
                extra_binds: &["/usr/bin/python3"],
            }),
        );
        registry
    }

    /// Prepares `source` with its sources laid out under `root`
    pub fn prepare_in(
        &self,
        root: &Path,
        language: Language,
        source: &str,
    ) -> Result<Box<dyn Recipe>, PrepareError> {
        self.preparators
            .get(&language)
            .ok_or(PrepareError::UnknownLanguage(language))?
            .prepare(root, source)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::builtin)
}

/// Prepares `source` at the container's fixed source locations
pub fn prepare(language: Language, source: &str) -> Result<Box<dyn Recipe>, PrepareError> {
    registry().prepare_in(Path::new("/"), language, source)
}
