//! Dataset specific query helpers, looked up by (dataset slug, table name).
//!
//! Tables without an extension only get the generic [`TableQuery`] builder.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::query::TableQuery;

pub trait TableExtension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names accepted by [`TableExtension::lookup`].
    fn lookups(&self) -> &'static [&'static str];

    /// Narrows `query` with the named lookup.
    fn lookup(
        &self,
        query: TableQuery,
        lookup: &str,
        argument: &str,
    ) -> Result<TableQuery, EngineError>;
}

#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    extensions: HashMap<(String, String), Arc<dyn TableExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every extension shipped with the engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            CompanyDocuments::DATASET,
            CompanyDocuments::TABLE,
            Arc::new(CompanyDocuments),
        );
        registry
    }

    pub fn register(&mut self, dataset_slug: &str, table_name: &str, extension: Arc<dyn TableExtension>) {
        self.extensions
            .insert((dataset_slug.to_string(), table_name.to_string()), extension);
    }

    pub fn get(&self, dataset_slug: &str, table_name: &str) -> Option<Arc<dyn TableExtension>> {
        self.extensions
            .get(&(dataset_slug.to_string(), table_name.to_string()))
            .cloned()
    }
}

/// Company records keyed by CNPJ. All establishments of a company share the
/// first 8 digits (the root); the headquarter is the one numbered `0001`.
pub struct CompanyDocuments;

impl CompanyDocuments {
    pub const DATASET: &'static str = "documentos-brasil";
    pub const TABLE: &'static str = "documents";
    const DOCUMENT: &'static str = "document";
    const DOCUMENT_TYPE: &'static str = "document_type";
    const DOCUMENT_ROOT: &'static str = "docroot";

    /// Digits of a formatted CNPJ (`12.345.678/0001-90`).
    pub fn clean_document(document: &str) -> String {
        document.chars().filter(char::is_ascii_digit).collect()
    }

    pub fn root(document: &str) -> Result<String, EngineError> {
        let digits = Self::clean_document(document);
        if digits.len() < 8 {
            return Err(EngineError::InvalidValue {
                field: Self::DOCUMENT.to_string(),
                field_type: "cnpj".to_string(),
                value: document.to_string(),
            });
        }
        Ok(digits[..8].to_string())
    }

    /// Every establishment sharing the CNPJ root of `document`.
    pub fn branches(&self, query: TableQuery, document: &str) -> Result<TableQuery, EngineError> {
        let root = Self::root(document)?;
        query
            .filter_eq(Self::DOCUMENT_ROOT, &root)?
            .filter_eq(Self::DOCUMENT_TYPE, "CNPJ")
    }

    pub fn headquarter(&self, query: TableQuery, document: &str) -> Result<TableQuery, EngineError> {
        let root = Self::root(document)?;
        self.branches(query, document)?
            .filter_prefix(Self::DOCUMENT, &format!("{}0001", root))
    }
}

impl TableExtension for CompanyDocuments {
    fn name(&self) -> &'static str {
        "company-documents"
    }

    fn lookups(&self) -> &'static [&'static str] {
        &["branches", "headquarter"]
    }

    fn lookup(
        &self,
        query: TableQuery,
        lookup: &str,
        argument: &str,
    ) -> Result<TableQuery, EngineError> {
        match lookup {
            "branches" => self.branches(query, argument),
            "headquarter" => self.headquarter(query, argument),
            other => Err(EngineError::UnknownLookup {
                table: query.definition().label(),
                lookup: other.to_string(),
            }),
        }
    }
}
