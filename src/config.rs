use std::sync::Arc;
use std::time::Duration;

use chrono::{Locale, NaiveDateTime};
use serde::Deserialize;

use crate::core::permissions::PermissionChecker;
use crate::errors::RenderError;

/// What happens to the slides carrying `%loop ...%` / `%endloop%`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMarkerMode {
    /// Marker slides belong to the repeated range; only the directive shapes are removed.
    #[default]
    StripDirectives,
    /// Marker slides are dropped; only the slides strictly between them repeat.
    DropMarkerSlides,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Abort on the first resolution/fetch error instead of marking it inline.
    pub fail_fast: bool,
    /// Locale used for month and weekday names in date formats.
    pub date_locale: String,
    #[serde(with = "duration_ms")]
    pub image_fetch_timeout: Duration,
    /// Value of the reserved `now` path. Read from the clock once per render when unset.
    pub now: Option<NaiveDateTime>,
    pub loop_markers: LoopMarkerMode,
    /// Duplicate a slide whose only placeholder resolves to a list.
    pub expand_standalone_lists: bool,
    /// Ask the renderer's [`PermissionChecker`] about every record a path reaches.
    pub check_permissions: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            date_locale: "en_US".to_string(),
            image_fetch_timeout: Duration::from_secs(10),
            now: None,
            loop_markers: LoopMarkerMode::default(),
            expand_standalone_lists: true,
            check_permissions: true,
        }
    }
}

impl RenderConfig {
    pub fn from_json(raw: &str) -> Result<Self, RenderError> {
        let config: RenderConfig = serde_json::from_str(raw)?;
        config.locale()?;
        Ok(config)
    }

    pub fn locale(&self) -> Result<Locale, RenderError> {
        Locale::try_from(self.date_locale.as_str())
            .map_err(|_| RenderError::Config(format!("unknown date locale '{}'", self.date_locale)))
    }

    pub fn set_fail_fast(&mut self, fail_fast: bool) -> &mut Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn set_date_locale(&mut self, locale: &str) -> &mut Self {
        self.date_locale = locale.to_string();
        self
    }

    pub fn set_image_fetch_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.image_fetch_timeout = timeout;
        self
    }

    pub fn set_now(&mut self, now: NaiveDateTime) -> &mut Self {
        self.now = Some(now);
        self
    }

    pub fn set_loop_markers(&mut self, mode: LoopMarkerMode) -> &mut Self {
        self.loop_markers = mode;
        self
    }

    pub fn set_expand_standalone_lists(&mut self, expand: bool) -> &mut Self {
        self.expand_standalone_lists = expand;
        self
    }

    pub fn set_check_permissions(&mut self, check: bool) -> &mut Self {
        self.check_permissions = check;
        self
    }
}

/// Per-render settings derived from [`RenderConfig`] once, then threaded everywhere.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub fail_fast: bool,
    pub locale: Locale,
    pub now: NaiveDateTime,
    pub image_fetch_timeout: Duration,
    pub loop_markers: LoopMarkerMode,
    pub expand_standalone_lists: bool,
    pub permissions: Option<Arc<dyn PermissionChecker>>,
}

impl RenderSettings {
    pub fn from_config(config: &RenderConfig) -> Result<Self, RenderError> {
        Ok(Self {
            fail_fast: config.fail_fast,
            locale: config.locale()?,
            now: config.now.unwrap_or_else(|| chrono::Local::now().naive_local()),
            image_fetch_timeout: config.image_fetch_timeout,
            loop_markers: config.loop_markers,
            expand_standalone_lists: config.expand_standalone_lists,
            permissions: None,
        })
    }

    /// Installs `checker` unless the config turned permission checks off.
    pub fn with_permissions(mut self, config: &RenderConfig, checker: Option<&Arc<dyn PermissionChecker>>) -> Self {
        self.permissions = checker.filter(|_| config.check_permissions).cloned();
        self
    }

    pub fn permission_checker(&self) -> Option<&dyn PermissionChecker> {
        self.permissions.as_deref()
    }
}

mod duration_ms {
    use std::sync::Arc;
use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
