use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::models::task::Task;

/// The user's tasks: ungrouped ones plus named groups. A task lives in
/// exactly one place. Persisted as pretty JSON.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<Task>>,
}

impl Catalog {
    /// Loads `path`; a missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No catalog at {}, starting empty.", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(CatalogError::Io { path: path.to_path_buf(), source }),
        };
        let catalog = serde_json::from_str(&content).map_err(|source| CatalogError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Catalog loaded from {}.", path.display());
        Ok(catalog)
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| CatalogError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validates and adds a new ungrouped task.
    pub fn add_task(&mut self, working_dir: &Path, command: &str, title: Option<&str>) -> Result<Task, CatalogError> {
        validate(working_dir, command)?;
        let task = Task::create(working_dir, command.trim(), title);
        self.tasks.push(task.clone());
        Ok(task)
    }

    pub fn update_task(&mut self, id: &str, working_dir: &Path, command: &str, title: Option<&str>) -> Result<Task, CatalogError> {
        validate(working_dir, command)?;
        let task = self.find_mut(id).ok_or_else(|| CatalogError::UnknownTask(id.to_string()))?;
        let updated = Task::create(working_dir, command.trim(), title);
        task.working_dir = updated.working_dir;
        task.command = updated.command;
        task.title = updated.title;
        Ok(task.clone())
    }

    /// Removes a task wherever it lives. An emptied group disappears.
    pub fn remove_task(&mut self, id: &str) -> Option<Task> {
        if let Some(pos) = self.tasks.iter().position(|t| t.id == id) {
            return Some(self.tasks.remove(pos));
        }
        let group = self
            .groups
            .iter()
            .find(|(_, tasks)| tasks.iter().any(|t| t.id == id))
            .map(|(name, _)| name.clone())?;
        let tasks = self.groups.get_mut(&group)?;
        let pos = tasks.iter().position(|t| t.id == id)?;
        let task = tasks.remove(pos);
        if tasks.is_empty() {
            self.groups.remove(&group);
        }
        Some(task)
    }

    pub fn find(&self, id: &str) -> Option<&Task> {
        self.all_tasks().find(|t| t.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks
            .iter_mut()
            .chain(self.groups.values_mut().flatten())
            .find(|t| t.id == id)
    }

    /// Resolves a full id or a unique id prefix.
    pub fn resolve(&self, prefix: &str) -> Result<&Task, CatalogError> {
        if let Some(task) = self.find(prefix) {
            return Ok(task);
        }
        let mut matches = self.all_tasks().filter(|t| !prefix.is_empty() && t.id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(task), None) => Ok(task),
            (Some(_), Some(_)) => Err(CatalogError::AmbiguousTask(prefix.to_string())),
            _ => Err(CatalogError::UnknownTask(prefix.to_string())),
        }
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().chain(self.groups.values().flatten())
    }

    /// Creates a group out of ungrouped tasks, which leave the ungrouped list.
    pub fn create_group(&mut self, name: &str, ids: &[String]) -> Result<&[Task], CatalogError> {
        if self.groups.contains_key(name) {
            return Err(CatalogError::DuplicateGroup(name.to_string()));
        }
        for id in ids {
            if !self.tasks.iter().any(|t| &t.id == id) {
                return Err(CatalogError::UnknownTask(id.clone()));
            }
        }
        let (members, rest): (Vec<Task>, Vec<Task>) = self.tasks.drain(..).partition(|t| ids.contains(&t.id));
        self.tasks = rest;
        let group = self.groups.entry(name.to_string()).or_default();
        *group = members;
        Ok(group.as_slice())
    }

    pub fn add_to_group(&mut self, name: &str, id: &str) -> Result<(), CatalogError> {
        if !self.groups.contains_key(name) {
            return Err(CatalogError::UnknownGroup(name.to_string()));
        }
        let pos = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| CatalogError::UnknownTask(id.to_string()))?;
        let task = self.tasks.remove(pos);
        self.groups.entry(name.to_string()).or_default().push(task);
        Ok(())
    }

    pub fn rename_group(&mut self, from: &str, to: &str) -> Result<(), CatalogError> {
        if self.groups.contains_key(to) {
            return Err(CatalogError::DuplicateGroup(to.to_string()));
        }
        let tasks = self
            .groups
            .remove(from)
            .ok_or_else(|| CatalogError::UnknownGroup(from.to_string()))?;
        self.groups.insert(to.to_string(), tasks);
        Ok(())
    }

    /// Deletes a group; its tasks move back to the ungrouped list.
    pub fn dissolve_group(&mut self, name: &str) -> Result<(), CatalogError> {
        let tasks = self
            .groups
            .remove(name)
            .ok_or_else(|| CatalogError::UnknownGroup(name.to_string()))?;
        self.tasks.extend(tasks);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Result<&[Task], CatalogError> {
        self.groups
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CatalogError::UnknownGroup(name.to_string()))
    }
}

fn validate(working_dir: &Path, command: &str) -> Result<(), CatalogError> {
    if command.trim().is_empty() {
        return Err(CatalogError::EmptyCommand);
    }
    if !working_dir.is_dir() {
        return Err(CatalogError::InvalidDirectory(PathBuf::from(working_dir)));
    }
    Ok(())
}
