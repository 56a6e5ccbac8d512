//! Filename entity parsing.

/// Entities carried by a dataset filename such as
/// `sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntities {
    /// Subject label.
    pub subject: Option<String>,
    /// Session label.
    pub session: Option<String>,
    /// Task label.
    pub task: Option<String>,
    /// Acquisition label.
    pub acquisition: Option<String>,
    /// Run index (kept as text so zero padding survives).
    pub run: Option<String>,
    /// Phase-encoding direction label.
    pub direction: Option<String>,
    /// Complex part (`mag`, `phase`).
    pub part: Option<String>,
    /// Inversion index for multi-inversion structurals.
    pub inversion: Option<String>,
    /// Trailing suffix before the extension (`bold`, `T1w`, `MP2RAGE`, ...).
    pub suffix: String,
    /// Extension including the leading dot.
    pub extension: String,
}

fn is_label(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric())
}

impl FileEntities {
    /// Parses a file name; returns `None` if it does not look like an entity filename.
    #[must_use]
    pub fn parse(filename: &str) -> Option<Self> {
        let (stem, extension) = split_extension(filename);
        let mut parts: Vec<&str> = stem.split('_').collect();
        let suffix = parts.pop()?;
        if suffix.is_empty() || suffix.contains('-') {
            return None;
        }
        let mut entities = Self {
            suffix: suffix.to_string(),
            extension: extension.to_string(),
            ..Self::default()
        };
        for part in parts {
            let (key, value) = part.split_once('-')?;
            if !is_label(key) || !is_label(value) {
                return None;
            }
            let value = value.to_string();
            match key {
                "sub" => entities.subject = Some(value),
                "ses" => entities.session = Some(value),
                "task" => entities.task = Some(value),
                "acq" => entities.acquisition = Some(value),
                "run" => entities.run = Some(value),
                "dir" => entities.direction = Some(value),
                "part" => entities.part = Some(value),
                "inv" => entities.inversion = Some(value),
                _ => {}
            }
        }
        entities.subject.as_ref()?;
        Some(entities)
    }

    /// Returns true for a NIfTI image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.extension == ".nii.gz" || self.extension == ".nii"
    }

    /// `task-X_run-Y` identifier used to name slab checkpoints and stages.
    #[must_use]
    pub fn task_run_label(&self) -> String {
        format!(
            "task-{}_run-{}",
            self.task.as_deref().unwrap_or("none"),
            self.run.as_deref().unwrap_or("none")
        )
    }
}

/// Splits `name.nii.gz` into (`name`, `.nii.gz`).
#[must_use]
pub fn split_extension(filename: &str) -> (&str, &str) {
    for ext in [".nii.gz", ".nii", ".json", ".tsv"] {
        if let Some(stem) = filename.strip_suffix(ext) {
            return (stem, &filename[stem.len()..]);
        }
    }
    match filename.find('.') {
        Some(i) => (&filename[..i], &filename[i..]),
        None => (filename, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_functional_name() {
        let e = FileEntities::parse("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz").unwrap();
        assert_eq!(e.subject.as_deref(), Some("01"));
        assert_eq!(e.session.as_deref(), Some("02"));
        assert_eq!(e.task.as_deref(), Some("motor"));
        assert_eq!(e.direction.as_deref(), Some("AP"));
        assert_eq!(e.run.as_deref(), Some("01"));
        assert_eq!(e.part.as_deref(), Some("mag"));
        assert_eq!(e.suffix, "bold");
        assert_eq!(e.extension, ".nii.gz");
        assert!(e.is_image());
        assert_eq!(e.task_run_label(), "task-motor_run-01");
    }

    #[test]
    fn test_parse_structural_inversion() {
        let e = FileEntities::parse("sub-01_ses-01_inv-1_run-01_part-mag_MP2RAGE.json").unwrap();
        assert_eq!(e.inversion.as_deref(), Some("1"));
        assert_eq!(e.suffix, "MP2RAGE");
        assert!(!e.is_image());
    }

    #[test]
    fn test_rejects_non_entity_names() {
        assert!(FileEntities::parse("dataset_description.json").is_none());
        assert!(FileEntities::parse("README").is_none());
    }
}
