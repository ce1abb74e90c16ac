//! Family database for runtime loading and lookup
//!
//! The built-in families are compiled in from `families/*.ron`; more can be
//! loaded from a directory at runtime. A loaded family with the same name as
//! an existing one replaces it.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

use super::types::FamilyDescriptor;

/// Error type for family database operations
#[derive(Debug, Error)]
pub enum FamilyDbError {
    /// I/O error reading files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// RON parsing error
    #[error("Parse error in {origin}: {source}")]
    Parse {
        /// File or built-in table the error came from
        origin: String,
        /// Underlying RON error
        #[source]
        source: ron::error::SpannedError,
    },
    /// Descriptor failed its consistency checks
    #[error("Validation error: {0}")]
    Validation(String),
}

const BUILTIN: &[(&str, &str)] = &[
    ("stm32g0.ron", include_str!("../../families/stm32g0.ron")),
    ("stm32g4.ron", include_str!("../../families/stm32g4.ron")),
    ("stm32l4.ron", include_str!("../../families/stm32l4.ron")),
    ("stm32wb55.ron", include_str!("../../families/stm32wb55.ron")),
    ("stm32h7.ron", include_str!("../../families/stm32h7.ron")),
    ("stm32u5.ron", include_str!("../../families/stm32u5.ron")),
    ("msp432p4.ron", include_str!("../../families/msp432p4.ron")),
];

/// Runtime family database
#[derive(Debug, Clone, Default)]
pub struct FamilyDatabase {
    families: Vec<FamilyDescriptor>,
}

impl FamilyDatabase {
    /// Create an empty family database
    pub fn new() -> Self {
        Self {
            families: Vec::new(),
        }
    }

    /// Database holding every built-in family
    pub fn builtin() -> Result<Self, FamilyDbError> {
        let mut db = Self::new();
        for (origin, content) in BUILTIN {
            db.load_ron_named(content, origin)?;
        }
        Ok(db)
    }

    /// Load one family from a RON string
    pub fn load_ron(&mut self, content: &str) -> Result<&FamilyDescriptor, FamilyDbError> {
        self.load_ron_named(content, "<string>")
    }

    fn load_ron_named(
        &mut self,
        content: &str,
        origin: &str,
    ) -> Result<&FamilyDescriptor, FamilyDbError> {
        let family: FamilyDescriptor =
            ron::from_str(content).map_err(|source| FamilyDbError::Parse {
                origin: origin.to_string(),
                source,
            })?;
        family.validate().map_err(FamilyDbError::Validation)?;

        log::debug!("Loaded family {} from {}", family.name, origin);
        let index = match self.families.iter().position(|f| f.name == family.name) {
            Some(index) => {
                self.families[index] = family;
                index
            }
            None => {
                self.families.push(family);
                self.families.len() - 1
            }
        };
        Ok(&self.families[index])
    }

    /// Load a family definition from a single RON file
    pub fn load_file(&mut self, path: &Path) -> Result<&FamilyDescriptor, FamilyDbError> {
        let content = fs::read_to_string(path)?;
        self.load_ron_named(&content, &path.display().to_string())
    }

    /// Load all RON files from a directory
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, FamilyDbError> {
        let mut total = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "ron") {
                self.load_file(&path)?;
                total += 1;
            }
        }

        Ok(total)
    }

    /// Get all families in the database
    pub fn families(&self) -> &[FamilyDescriptor] {
        &self.families
    }

    /// Get the number of families in the database
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Check if the database is empty
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Find a family by name (case-insensitive)
    pub fn find(&self, name: &str) -> Option<&FamilyDescriptor> {
        self.families
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Families whose CPUID part number matches
    pub fn candidates(&self, cpu_part: u16) -> impl Iterator<Item = &FamilyDescriptor> {
        self.families.iter().filter(move |f| f.cpu_part == cpu_part)
    }

    /// Iterate over all families
    pub fn iter(&self) -> impl Iterator<Item = &FamilyDescriptor> {
        self.families.iter()
    }
}
