//! Installed-module manifest with scheduled changes.
//!
//! Module mutations cannot touch SHM while other connections hold module
//! references, so `install`/`remove`/`update`/feature/replay changes are
//! recorded in the on-disk manifest and applied by the next `connect` that
//! finds no live connections, rebuilding both SHM segments.

use crate::main_shm::{ModuleInit, OpDepInit};
use crate::layout::{DEP_INSTID, DEP_REF};
use serde::{Deserialize, Serialize};
use yds_common::{Repository, YdsError, YdsResult};
use yds_data::schema::{DepType, SchemaModule};

/// One installed module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestModule {
    /// Module schema, including enabled features.
    pub schema: SchemaModule,
    /// Whether notifications are logged for replay.
    pub replay_support: bool,
}

/// A module change waiting for a connection-free moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduledChange {
    /// Install a new module.
    Install {
        /// Schema to install.
        schema: SchemaModule,
    },
    /// Remove an installed module.
    Remove {
        /// Module name.
        name: String,
    },
    /// Replace an installed module's schema (upgrade).
    Update {
        /// Replacement schema.
        schema: SchemaModule,
    },
    /// Enable or disable a feature.
    ChangeFeature {
        /// Module name.
        module: String,
        /// Feature name.
        feature: String,
        /// Enable or disable.
        enable: bool,
    },
    /// Change replay support.
    SetReplay {
        /// Module name.
        module: String,
        /// Enable or disable.
        enable: bool,
    },
}

/// The installed-module registry persisted next to the data files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Installed modules.
    pub modules: Vec<ManifestModule>,
    /// Pending scheduled changes, in submission order.
    pub scheduled: Vec<ScheduledChange>,
}

impl Manifest {
    /// Load the manifest; a missing file yields an empty registry.
    pub fn load(repo: &Repository) -> YdsResult<Manifest> {
        let path = repo.manifest_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest::default());
            }
            Err(e) => return Err(YdsError::from_io(path.display().to_string(), e)),
        };
        serde_json::from_str(&text).map_err(|e| YdsError::Internal {
            msg: format!("Corrupted manifest \"{}\": {}.", path.display(), e),
        })
    }

    /// Persist the manifest atomically.
    pub fn store(&self, repo: &Repository) -> YdsResult<()> {
        let path = repo.manifest_path();
        let tmp = path.with_extension("json.new");
        let text = serde_json::to_string_pretty(self).map_err(|e| YdsError::Internal {
            msg: format!("Failed to encode manifest: {}.", e),
        })?;
        std::fs::write(&tmp, text)
            .map_err(|e| YdsError::from_io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Installed module schema by name.
    pub fn schema(&self, name: &str) -> Option<&SchemaModule> {
        self.modules
            .iter()
            .map(|m| &m.schema)
            .find(|s| s.name == name)
    }

    fn installed(&self, name: &str) -> bool {
        self.schema(name).is_some()
    }

    /// Record a change for the next connection-free application, checking
    /// it against the currently applied registry.
    pub fn schedule(&mut self, change: ScheduledChange) -> YdsResult<()> {
        match &change {
            ScheduledChange::Install { schema } => {
                if self.installed(&schema.name) {
                    return Err(YdsError::Exists {
                        msg: format!("Module \"{}\".", schema.name),
                    });
                }
            }
            ScheduledChange::Remove { name } => {
                if !self.installed(name) {
                    return Err(YdsError::NotFound {
                        msg: format!("Module \"{}\".", name),
                    });
                }
            }
            ScheduledChange::Update { schema } => {
                if !self.installed(&schema.name) {
                    return Err(YdsError::NotFound {
                        msg: format!("Module \"{}\".", schema.name),
                    });
                }
            }
            ScheduledChange::ChangeFeature { module, .. }
            | ScheduledChange::SetReplay { module, .. } => {
                if !self.installed(module) {
                    return Err(YdsError::NotFound {
                        msg: format!("Module \"{}\".", module),
                    });
                }
            }
        }
        self.scheduled.push(change);
        Ok(())
    }

    /// Apply all scheduled changes in order. Returns whether the module set
    /// changed; failures of individual changes are collected, the rest
    /// still applies.
    pub fn apply_scheduled(&mut self) -> (bool, Vec<YdsError>) {
        let mut changed = false;
        let mut errors = Vec::new();
        let scheduled = std::mem::take(&mut self.scheduled);
        for change in scheduled {
            match self.apply_one(change) {
                Ok(()) => changed = true,
                Err(e) => {
                    tracing::warn!("Scheduled module change failed: {}.", e);
                    errors.push(e);
                }
            }
        }
        (changed, errors)
    }

    fn apply_one(&mut self, change: ScheduledChange) -> YdsResult<()> {
        match change {
            ScheduledChange::Install { schema } => {
                if self.installed(&schema.name) {
                    return Err(YdsError::Exists {
                        msg: format!("Module \"{}\".", schema.name),
                    });
                }
                tracing::info!("Module \"{}\" installed.", schema.name);
                self.modules.push(ManifestModule {
                    schema,
                    replay_support: false,
                });
                Ok(())
            }
            ScheduledChange::Remove { name } => {
                let before = self.modules.len();
                self.modules.retain(|m| m.schema.name != name);
                if self.modules.len() == before {
                    return Err(YdsError::NotFound {
                        msg: format!("Module \"{}\".", name),
                    });
                }
                tracing::info!("Module \"{}\" removed.", name);
                Ok(())
            }
            ScheduledChange::Update { schema } => {
                let m = self
                    .modules
                    .iter_mut()
                    .find(|m| m.schema.name == schema.name)
                    .ok_or_else(|| YdsError::NotFound {
                        msg: format!("Module \"{}\".", schema.name),
                    })?;
                tracing::info!(
                    "Module \"{}\" updated to revision {}.",
                    schema.name,
                    schema.revision
                );
                m.schema = schema;
                Ok(())
            }
            ScheduledChange::ChangeFeature {
                module,
                feature,
                enable,
            } => {
                let m = self
                    .modules
                    .iter_mut()
                    .find(|m| m.schema.name == module)
                    .ok_or_else(|| YdsError::NotFound {
                        msg: format!("Module \"{}\".", module),
                    })?;
                let have = m.schema.features.iter().any(|f| *f == feature);
                if enable == have {
                    return Err(YdsError::Exists {
                        msg: format!(
                            "Feature \"{}\" of module \"{}\" already {}.",
                            feature,
                            module,
                            if enable { "enabled" } else { "disabled" }
                        ),
                    });
                }
                if enable {
                    m.schema.features.push(feature);
                } else {
                    m.schema.features.retain(|f| *f != feature);
                }
                Ok(())
            }
            ScheduledChange::SetReplay { module, enable } => {
                let m = self
                    .modules
                    .iter_mut()
                    .find(|m| m.schema.name == module)
                    .ok_or_else(|| YdsError::NotFound {
                        msg: format!("Module \"{}\".", module),
                    })?;
                m.replay_support = enable;
                Ok(())
            }
        }
    }

    /// Materialize SHM module definitions, deriving dependency arrays and
    /// their inverses from the schemas.
    pub fn module_inits(&self) -> Vec<ModuleInit> {
        let dep_kind = |t: DepType| match t {
            DepType::Ref => DEP_REF,
            DepType::InstId => DEP_INSTID,
        };

        let mut inits: Vec<ModuleInit> = self
            .modules
            .iter()
            .map(|m| ModuleInit {
                name: m.schema.name.clone(),
                revision: m.schema.revision.clone(),
                features: m.schema.features.clone(),
                replay_support: m.replay_support,
                data_deps: m
                    .schema
                    .data_deps()
                    .into_iter()
                    .map(|d| (dep_kind(d.dep_type), d.target_module, d.xpath))
                    .collect(),
                inv_data_deps: Vec::new(),
                op_deps: m
                    .schema
                    .op_deps()
                    .into_iter()
                    .map(|op| OpDepInit {
                        xpath: op.xpath,
                        in_deps: op
                            .in_deps
                            .into_iter()
                            .map(|d| (dep_kind(d.dep_type), d.target_module, d.xpath))
                            .collect(),
                        out_deps: op
                            .out_deps
                            .into_iter()
                            .map(|d| (dep_kind(d.dep_type), d.target_module, d.xpath))
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        // Invert the dependency edges.
        let edges: Vec<(String, String)> = inits
            .iter()
            .flat_map(|i| {
                i.data_deps
                    .iter()
                    .filter(|(kind, _, _)| *kind == DEP_REF)
                    .map(|(_, target, _)| (i.name.clone(), target.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (source, target) in edges {
            if let Some(t) = inits.iter_mut().find(|i| i.name == target) {
                if !t.inv_data_deps.contains(&source) {
                    t.inv_data_deps.push(source);
                }
            }
        }
        inits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yds_data::schema::{SchemaNode, ValueType};

    fn schema(name: &str) -> SchemaModule {
        let mut m = SchemaModule::new(name, "2024-01-01");
        m.nodes = vec![SchemaNode::leaf("x", ValueType::String)];
        m
    }

    #[test]
    fn test_schedule_and_apply() {
        let mut man = Manifest::default();
        man.schedule(ScheduledChange::Install { schema: schema("a") }).unwrap();
        man.schedule(ScheduledChange::Install { schema: schema("b") }).unwrap();
        assert!(man.modules.is_empty());

        let (changed, errors) = man.apply_scheduled();
        assert!(changed);
        assert!(errors.is_empty());
        assert!(man.installed("a") && man.installed("b"));
        assert!(man.scheduled.is_empty());

        man.schedule(ScheduledChange::Remove { name: "a".to_string() }).unwrap();
        let (changed, errors) = man.apply_scheduled();
        assert!(changed && errors.is_empty());
        assert!(!man.installed("a"));
    }

    #[test]
    fn test_schedule_validation() {
        let mut man = Manifest::default();
        man.schedule(ScheduledChange::Install { schema: schema("a") }).unwrap();
        man.apply_scheduled();
        assert!(matches!(
            man.schedule(ScheduledChange::Install { schema: schema("a") }),
            Err(YdsError::Exists { .. })
        ));
        assert!(matches!(
            man.schedule(ScheduledChange::Remove { name: "zz".to_string() }),
            Err(YdsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_apply_matches_direct_application() {
        // A scheduled sequence applies exactly like direct set operations.
        let mut man = Manifest::default();
        for change in [
            ScheduledChange::Install { schema: schema("a") },
            ScheduledChange::Install { schema: schema("b") },
            ScheduledChange::Install { schema: schema("c") },
        ] {
            man.schedule(change).unwrap();
        }
        man.apply_scheduled();
        man.schedule(ScheduledChange::Remove { name: "b".to_string() }).unwrap();
        man.schedule(ScheduledChange::ChangeFeature {
            module: "c".to_string(),
            feature: "f".to_string(),
            enable: true,
        })
        .unwrap();
        let (changed, errors) = man.apply_scheduled();
        assert!(changed && errors.is_empty());

        let names: Vec<&str> = man.modules.iter().map(|m| m.schema.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(man.schema("c").unwrap().features, vec!["f".to_string()]);
    }

    #[test]
    fn test_module_inits_inverse_deps() {
        let mut man = Manifest::default();
        let mut a = schema("a");
        let mut peer = SchemaNode::leaf("peer", ValueType::String);
        peer.leafref = Some("/b:x".to_string());
        a.nodes.push(peer);
        man.schedule(ScheduledChange::Install { schema: a }).unwrap();
        man.schedule(ScheduledChange::Install { schema: schema("b") }).unwrap();
        man.apply_scheduled();

        let inits = man.module_inits();
        let a = inits.iter().find(|i| i.name == "a").unwrap();
        assert_eq!(a.data_deps.len(), 1);
        assert_eq!(a.data_deps[0].1, "b");
        let b = inits.iter().find(|i| i.name == "b").unwrap();
        assert_eq!(b.inv_data_deps, vec!["a".to_string()]);
    }

    #[test]
    fn test_store_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        repo.ensure_dirs().unwrap();

        let mut man = Manifest::default();
        man.schedule(ScheduledChange::Install { schema: schema("a") }).unwrap();
        man.store(&repo).unwrap();

        let loaded = Manifest::load(&repo).unwrap();
        assert_eq!(loaded.scheduled.len(), 1);
        assert!(loaded.modules.is_empty());
    }
}
