use std::fmt;

pub(crate) const HANDSHAKE_TITLE: &str = "🤝";

/// Either a percentage or the signal for the UI to close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressValue {
    Percent(u8),
    Finished,
}

/// One human-readable status update.
///
/// A `title` of `None` asks the sink to keep the current title.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub title: Option<String>,
    pub value: ProgressValue,
}

impl Progress {
    pub fn percent(value: u8) -> Self {
        Self {
            title: None,
            value: ProgressValue::Percent(value.min(100)),
        }
    }

    pub fn titled(title: impl Into<String>, value: u8) -> Self {
        Self {
            title: Some(title.into()),
            value: ProgressValue::Percent(value.min(100)),
        }
    }

    pub fn finished() -> Self {
        Self {
            title: None,
            value: ProgressValue::Finished,
        }
    }

    pub(crate) fn handshake(value: u8) -> Self {
        Self::titled(HANDSHAKE_TITLE, value)
    }

    /// Start of the file at zero-based `index` out of `total`.
    pub(crate) fn file(index: usize, total: usize) -> Self {
        Self::titled(file_label(index, total), 0)
    }
}

pub(crate) fn file_label(index: usize, total: usize) -> String {
    format!("📂 {}/{}", index + 1, total)
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(title) = &self.title {
            write!(f, "{title} ")?;
        }
        match self.value {
            ProgressValue::Percent(value) => write!(f, "{value}%"),
            ProgressValue::Finished => write!(f, "finished"),
        }
    }
}

/// Receives status and percentage updates, typically a progress dialog.
pub trait ProgressSink: Send + Sync {
    fn update_progress(&self, progress: &Progress);
}

/// Sink that only traces updates.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn update_progress(&self, progress: &Progress) {
        log::debug!("progress: {progress}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_one_based() {
        assert_eq!(file_label(0, 3), "📂 1/3");
        assert_eq!(Progress::file(2, 3).title.as_deref(), Some("📂 3/3"));
    }

    #[test]
    fn percent_is_capped() {
        assert_eq!(Progress::percent(250).value, ProgressValue::Percent(100));
    }

    #[test]
    fn displays_title_and_value() {
        assert_eq!(Progress::handshake(25).to_string(), "🤝 25%");
        assert_eq!(Progress::finished().to_string(), "finished");
    }
}
