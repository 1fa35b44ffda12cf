//! Workflow definition management service.
//!
//! Owns the authoring lifecycle of definitions: create, update, import from
//! YAML/JSON, activate, deactivate and default selection. Validation runs
//! automatically before a definition is activated and before an update
//! changes the steps of an active definition.

use chrono::Utc;
use tenure_types::error::RepositoryError;
use tenure_types::validation::ValidationResult;
use tenure_types::workflow::{ProcessType, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use crate::repository::definition::DefinitionRepository;
use crate::workflow::validator::{parse_definition, validate_definition, validate_source};

#[derive(Debug, thiserror::Error)]
pub enum DefinitionServiceError {
    #[error("workflow definition not found: {0}")]
    NotFound(String),

    #[error("workflow definition code '{0}' already exists")]
    CodeConflict(String),

    #[error("workflow definition is invalid: {}", .0.error_summary())]
    Invalid(ValidationResult),

    #[error("workflow definition '{0}' is not active")]
    Inactive(String),

    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl From<RepositoryError> for DefinitionServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => DefinitionServiceError::CodeConflict(msg),
            other => DefinitionServiceError::Repository(other),
        }
    }
}

/// Options for [`DefinitionService::import_source`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub activate: bool,
    pub make_default: bool,
}

/// What an import did.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub definition: WorkflowDefinition,
    /// `false` when an existing definition with the same code was updated.
    pub created: bool,
    pub validation: ValidationResult,
}

/// Service orchestrating the definition lifecycle.
pub struct DefinitionService<D: DefinitionRepository> {
    repo: D,
}

impl<D: DefinitionRepository> DefinitionService<D> {
    pub fn new(repo: D) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &D {
        &self.repo
    }

    // -- Validation --

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationResult {
        validate_definition(definition)
    }

    /// Validate raw YAML or JSON; parse failures come back as `STEPS_PARSE_ERROR`.
    pub fn validate_source(&self, source: &str) -> ValidationResult {
        validate_source(source)
    }

    // -- Queries --

    pub async fn get(&self, id: &Uuid) -> Result<WorkflowDefinition, DefinitionServiceError> {
        self.repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| DefinitionServiceError::NotFound(id.to_string()))
    }

    pub async fn get_by_code(&self, code: &str) -> Result<WorkflowDefinition, DefinitionServiceError> {
        self.repo
            .get_by_code(code)
            .await?
            .ok_or_else(|| DefinitionServiceError::NotFound(code.to_string()))
    }

    pub async fn list(
        &self,
        process_type: Option<ProcessType>,
    ) -> Result<Vec<WorkflowDefinition>, DefinitionServiceError> {
        Ok(self.repo.list_by_type(process_type).await?)
    }

    // -- Lifecycle --

    /// Store a new definition.
    ///
    /// Drafts may be invalid. A definition submitted as active must validate,
    /// and a default flag is only honoured through
    /// [`set_default_for_type`](Self::set_default_for_type).
    pub async fn create(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, DefinitionServiceError> {
        if definition.is_active {
            ensure_valid(&definition)?;
        }
        let make_default = definition.is_default;
        let now = Utc::now();
        definition.is_default = false;
        definition.version = definition.version.max(1);
        definition.stats = Default::default();
        definition.created_at = now;
        definition.updated_at = now;

        let created = self.repo.create(&definition).await?;
        tracing::info!(
            definition_id = %created.id,
            code = created.code.as_str(),
            process_type = %created.process_type,
            "workflow definition created"
        );

        if make_default && created.is_active {
            return self.set_default_for_type(&created.id).await;
        }
        Ok(created)
    }

    /// Replace a definition's content, keeping its identity and statistics.
    ///
    /// A changed step set is validated first, even on drafts, and bumps the
    /// version. Metadata-only edits to an invalid draft are still accepted.
    pub async fn update(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, DefinitionServiceError> {
        let existing = self.get(&definition.id).await?;
        let steps_changed = !same_steps(&existing.steps, &definition.steps);

        if steps_changed || (definition.is_active && !existing.is_active) {
            ensure_valid(&definition)?;
        }

        definition.version = if steps_changed {
            existing.version + 1
        } else {
            existing.version
        };
        definition.is_default = existing.is_default && definition.is_active;
        definition.stats = existing.stats;
        definition.created_at = existing.created_at;
        definition.updated_at = Utc::now();

        let updated = self.repo.update(&definition).await?;
        tracing::info!(
            definition_id = %updated.id,
            code = updated.code.as_str(),
            version = updated.version,
            steps_changed,
            "workflow definition updated"
        );
        Ok(updated)
    }

    /// Validate and publish a definition so instances can start from it.
    pub async fn activate(&self, id: &Uuid) -> Result<WorkflowDefinition, DefinitionServiceError> {
        let mut definition = self.get(id).await?;
        ensure_valid(&definition)?;
        if definition.is_active {
            return Ok(definition);
        }
        definition.is_active = true;
        definition.updated_at = Utc::now();
        let updated = self.repo.update(&definition).await?;
        tracing::info!(definition_id = %id, code = updated.code.as_str(), "workflow definition activated");
        Ok(updated)
    }

    /// Stop new instances from starting. Running instances are unaffected.
    pub async fn deactivate(&self, id: &Uuid) -> Result<WorkflowDefinition, DefinitionServiceError> {
        let mut definition = self.get(id).await?;
        definition.is_active = false;
        definition.is_default = false;
        definition.updated_at = Utc::now();
        let updated = self.repo.update(&definition).await?;
        tracing::info!(definition_id = %id, code = updated.code.as_str(), "workflow definition deactivated");
        Ok(updated)
    }

    /// Make a definition the default for its process type, clearing the previous one.
    pub async fn set_default_for_type(
        &self,
        id: &Uuid,
    ) -> Result<WorkflowDefinition, DefinitionServiceError> {
        let mut definition = self.get(id).await?;
        if !definition.is_active {
            return Err(DefinitionServiceError::Inactive(definition.code));
        }

        if let Some(mut previous) = self.repo.get_default_for_type(definition.process_type).await? {
            if previous.id != definition.id {
                previous.is_default = false;
                previous.updated_at = Utc::now();
                self.repo.update(&previous).await?;
                tracing::debug!(
                    previous = previous.code.as_str(),
                    process_type = %definition.process_type,
                    "cleared previous default definition"
                );
            }
        }

        definition.is_default = true;
        definition.updated_at = Utc::now();
        let updated = self.repo.update(&definition).await?;
        tracing::info!(
            definition_id = %id,
            code = updated.code.as_str(),
            process_type = %updated.process_type,
            "default workflow definition set"
        );
        Ok(updated)
    }

    /// Create or update a definition from a YAML/JSON document.
    ///
    /// An existing definition with the same code is updated in place.
    pub async fn import_source(
        &self,
        source: &str,
        options: ImportOptions,
    ) -> Result<ImportOutcome, DefinitionServiceError> {
        let mut parsed = parse_definition(source).map_err(DefinitionServiceError::Invalid)?;
        let existing = self.repo.get_by_code(&parsed.code).await?;
        let validation = validate_definition(&parsed);

        parsed.is_active = parsed.is_active
            || options.activate
            || existing.as_ref().is_some_and(|e| e.is_active);
        parsed.is_default = false;
        if parsed.is_active && !validation.valid {
            return Err(DefinitionServiceError::Invalid(validation));
        }

        let (mut definition, created) = match existing {
            Some(existing) => {
                parsed.id = existing.id;
                (self.update(parsed).await?, false)
            }
            None => (self.create(parsed).await?, true),
        };

        if options.make_default {
            definition = self.set_default_for_type(&definition.id).await?;
        }
        Ok(ImportOutcome {
            definition,
            created,
            validation,
        })
    }
}

fn ensure_valid(definition: &WorkflowDefinition) -> Result<(), DefinitionServiceError> {
    let result = validate_definition(definition);
    if result.valid {
        Ok(())
    } else {
        tracing::warn!(
            code = definition.code.as_str(),
            errors = result.errors.len(),
            "workflow definition failed validation"
        );
        Err(DefinitionServiceError::Invalid(result))
    }
}

fn same_steps(a: &[StepDefinition], b: &[StepDefinition]) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryDefinitions, definition, step};
    use tenure_types::validation::ValidationCode;
    use tenure_types::workflow::StepConfig;

    fn service() -> DefinitionService<MemoryDefinitions> {
        DefinitionService::new(MemoryDefinitions::default())
    }

    fn draft(code: &str) -> WorkflowDefinition {
        let mut def = definition(vec![
            step("start", 1, StepConfig::Start {}),
            step("end", 2, StepConfig::End {}),
        ]);
        def.code = code.to_string();
        def.is_active = false;
        def
    }

    fn broken(code: &str) -> WorkflowDefinition {
        let mut def = draft(code);
        def.steps.pop();
        def
    }

    #[tokio::test]
    async fn test_create_draft_and_reject_duplicate_code() {
        let svc = service();
        let created = svc.create(broken("joiner")).await.unwrap();
        assert!(!created.is_active);
        assert_eq!(created.version, 1);

        let err = svc.create(draft("joiner")).await.unwrap_err();
        assert!(matches!(err, DefinitionServiceError::CodeConflict(_)));
    }

    #[tokio::test]
    async fn test_activate_requires_valid_definition() {
        let svc = service();
        let bad = svc.create(broken("bad")).await.unwrap();
        let err = svc.activate(&bad.id).await.unwrap_err();
        match err {
            DefinitionServiceError::Invalid(result) => {
                assert!(result.has_error(ValidationCode::MissingEndStep));
            }
            other => panic!("unexpected error: {other}"),
        }

        let good = svc.create(draft("good")).await.unwrap();
        let active = svc.activate(&good.id).await.unwrap();
        assert!(active.is_active);
    }

    #[tokio::test]
    async fn test_update_bumps_version_only_when_steps_change() {
        let svc = service();
        let created = svc.create(draft("joiner")).await.unwrap();
        let active = svc.activate(&created.id).await.unwrap();

        let mut retitled = active.clone();
        retitled.title = "Joiner (EU)".into();
        let updated = svc.update(retitled).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.title, "Joiner (EU)");

        let mut extended = updated.clone();
        extended.steps.insert(1, step("notify", 2, StepConfig::Action {
            action: "welcome".into(),
            parameters: serde_json::json!({}),
        }));
        extended.steps[2].order = 3;
        let updated = svc.update(extended).await.unwrap();
        assert_eq!(updated.version, 2);

        let mut gutted = updated.clone();
        gutted.steps.pop();
        assert!(matches!(
            svc.update(gutted).await.unwrap_err(),
            DefinitionServiceError::Invalid(_)
        ));
        assert_eq!(svc.get(&created.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_validates_changed_steps_on_drafts() {
        let svc = service();
        let created = svc.create(draft("joiner")).await.unwrap();
        assert!(!created.is_active);

        let mut gutted = created.clone();
        gutted.steps.pop();
        match svc.update(gutted).await.unwrap_err() {
            DefinitionServiceError::Invalid(result) => {
                assert!(result.has_error(ValidationCode::MissingEndStep));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(svc.get(&created.id).await.unwrap().steps.len(), 2);

        // An already-broken draft can still be renamed.
        let bad = svc.create(broken("bad")).await.unwrap();
        let mut retitled = bad.clone();
        retitled.title = "Renamed".into();
        assert_eq!(svc.update(retitled).await.unwrap().title, "Renamed");
    }

    #[tokio::test]
    async fn test_single_default_per_process_type() {
        let svc = service();
        let a = svc.create(draft("a")).await.unwrap();
        let b = svc.create(draft("b")).await.unwrap();

        assert!(matches!(
            svc.set_default_for_type(&a.id).await.unwrap_err(),
            DefinitionServiceError::Inactive(_)
        ));

        svc.activate(&a.id).await.unwrap();
        svc.activate(&b.id).await.unwrap();
        svc.set_default_for_type(&a.id).await.unwrap();
        svc.set_default_for_type(&b.id).await.unwrap();

        assert!(!svc.get(&a.id).await.unwrap().is_default);
        assert!(svc.get(&b.id).await.unwrap().is_default);

        let deactivated = svc.deactivate(&b.id).await.unwrap();
        assert!(!deactivated.is_default);
        assert!(
            svc.repository()
                .get_default_for_type(ProcessType::Joiner)
                .await
                .unwrap()
                .is_none()
        );
    }

    const YAML: &str = r#"
title: Standard leaver
code: standard-leaver
process_type: leaver
steps:
  - { id: start, name: Start, order: 1, config: { type: start } }
  - { id: revoke, name: Revoke access, order: 2, config: { type: action, action: revoke_all } }
  - { id: end, name: End, order: 3, config: { type: end } }
"#;

    #[tokio::test]
    async fn test_import_creates_then_updates() {
        let svc = service();
        let first = svc
            .import_source(YAML, ImportOptions { activate: true, make_default: true })
            .await
            .unwrap();
        assert!(first.created);
        assert!(first.definition.is_active);
        assert!(first.definition.is_default);
        assert!(first.validation.valid);

        let changed = YAML.replace("revoke_all", "revoke_everything");
        let second = svc
            .import_source(&changed, ImportOptions::default())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.definition.id, first.definition.id);
        assert_eq!(second.definition.version, 2);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_source() {
        let svc = service();
        let err = svc
            .import_source("title: x\n", ImportOptions::default())
            .await
            .unwrap_err();
        match err {
            DefinitionServiceError::Invalid(result) => {
                assert!(result.has_error(ValidationCode::MissingCode));
            }
            other => panic!("unexpected error: {other}"),
        }

        let no_end = YAML.replace("  - { id: end, name: End, order: 3, config: { type: end } }\n", "");
        let err = svc
            .import_source(&no_end, ImportOptions { activate: true, make_default: false })
            .await
            .unwrap_err();
        assert!(matches!(err, DefinitionServiceError::Invalid(_)));

        // Drafts may be stored while still invalid.
        let outcome = svc.import_source(&no_end, ImportOptions::default()).await.unwrap();
        assert!(!outcome.validation.valid);
        assert!(!outcome.definition.is_active);
    }
}
