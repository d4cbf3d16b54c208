//! persona prompts: one utf-8 `.txt` file per character.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bevy::log::{debug, info};

use crate::error::ChatError;

/// where the live user message goes in a persona prompt.
pub const USER_MESSAGE_PLACEHOLDER: &str = "{{USER_MESSAGE}}";
/// what the placeholder is rewritten to in the system instruction.
pub const USER_INPUT_PATTERN: &str = "{user_input}";

/// a named character and its raw prompt text. immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: String,
    pub instructions: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
        }
    }

    /// the instruction handed to the provider when an exchange starts.
    pub fn system_instruction(&self) -> String {
        self.instructions
            .replace(USER_MESSAGE_PLACEHOLDER, USER_INPUT_PATTERN)
    }
}

/// read access to the available personas.
pub trait PersonaSource: Send + Sync {
    /// persona names, sorted.
    fn list_persona_names(&self) -> Result<Vec<String>, ChatError>;

    fn load_persona(&self, name: &str) -> Result<Arc<Persona>, ChatError>;
}

/// personas backed by a directory of `<name>.txt` files.
///
/// each file is read at most once; later loads hit the cache.
#[derive(Debug)]
pub struct DirPersonaStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<Persona>>>,
}

impl DirPersonaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.txt"))
    }

    fn cached(&self, name: &str) -> Option<Arc<Persona>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(name).cloned()
    }
}

/// a file's persona name: the file name without its `.txt` suffix, so every
/// listed name loads from `<name>.txt`.
fn persona_name(file_name: &str) -> Option<&str> {
    file_name.strip_suffix(".txt").filter(|n| !n.is_empty())
}

impl PersonaSource for DirPersonaStore {
    fn list_persona_names(&self) -> Result<Vec<String>, ChatError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| ChatError::PersonaDirectory {
            path: self.dir.clone(),
            message: e.to_string(),
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let file_name = entry.file_name();
                persona_name(&file_name.to_string_lossy()).map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();

        debug!(target: "bevy_persona_chat", "list_persona_names: dir={} count={}", self.dir.display(), names.len());
        Ok(names)
    }

    fn load_persona(&self, name: &str) -> Result<Arc<Persona>, ChatError> {
        if let Some(persona) = self.cached(name) {
            return Ok(persona);
        }

        // names never address files outside the prompt directory
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ChatError::PersonaNotFound { name: name.to_string() });
        }

        let path = self.path_for(name);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ChatError::PersonaNotFound { name: name.to_string() },
            _ => ChatError::PersonaIo {
                name: name.to_string(),
                message: e.to_string(),
            },
        })?;

        info!(target: "bevy_persona_chat", "load_persona: '{}' ({} bytes)", name, text.len());
        let persona = Arc::new(Persona::new(name, text));

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        // another loader may have raced us; keep whichever landed first
        Ok(cache.entry(name.to_string()).or_insert(persona).clone())
    }
}
