//! Configuration validation.

use crate::config::{Config, EmbedderSettings, PipelineSettings, ResolutionSettings, Settings};
use crate::constants::threshold;
use crate::domain::PartitionMap;
use crate::error::{Error, Result};
use std::time::Duration;

/// Validate the configuration and convert it into runtime settings.
///
/// This is the startup gate: an incomplete partition table fails here with
/// [`Error::PartitionMappingIncomplete`] before any detection is touched.
pub fn build_settings(config: &Config) -> Result<Settings> {
    let partitions = PartitionMap::from_table(&config.partitions)?;
    let resolution = validate_resolution(config)?;
    let embedder = validate_embedder(config)?;
    let pipeline = validate_pipeline(config)?;

    Ok(Settings {
        resolution,
        embedder,
        pipeline,
        partitions,
    })
}

fn check_threshold(name: &str, value: f32) -> Result<()> {
    if !(threshold::MIN..=threshold::MAX).contains(&value) {
        return Err(Error::ConfigValidation {
            message: format!(
                "{name} must be between {} and {}, got {value}",
                threshold::MIN,
                threshold::MAX
            ),
        });
    }
    Ok(())
}

fn validate_resolution(config: &Config) -> Result<ResolutionSettings> {
    let resolution = &config.resolution;

    check_threshold("iou_threshold", resolution.iou_threshold)?;

    let similarity_threshold =
        resolution
            .similarity_threshold
            .ok_or_else(|| Error::ConfigValidation {
                message: "similarity_threshold is not set (set resolution.similarity_threshold \
                          or pass --similarity-threshold)"
                    .to_string(),
            })?;
    check_threshold("similarity_threshold", similarity_threshold)?;

    if resolution.burst_window_secs == 0 {
        return Err(Error::ConfigValidation {
            message: "burst_window_secs must be at least 1".to_string(),
        });
    }

    if resolution.min_crop_px == 0 {
        return Err(Error::ConfigValidation {
            message: "min_crop_px must be at least 1".to_string(),
        });
    }

    if resolution.search_top_k == 0 {
        return Err(Error::ConfigValidation {
            message: "search_top_k must be at least 1".to_string(),
        });
    }

    Ok(ResolutionSettings {
        iou_threshold: resolution.iou_threshold,
        burst_window: Duration::from_secs(resolution.burst_window_secs),
        min_crop_px: resolution.min_crop_px,
        similarity_threshold,
        search_top_k: resolution.search_top_k,
        embedding_update: resolution.embedding_update,
    })
}

fn validate_embedder(config: &Config) -> Result<EmbedderSettings> {
    let embedder = &config.embedder;

    if embedder.dimension == 0 {
        return Err(Error::ConfigValidation {
            message: "embedder.dimension must be at least 1".to_string(),
        });
    }

    if embedder.timeout_secs == 0 {
        return Err(Error::ConfigValidation {
            message: "embedder.timeout_secs must be at least 1".to_string(),
        });
    }

    if let Some(endpoint) = &embedder.endpoint
        && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
    {
        return Err(Error::ConfigValidation {
            message: format!("embedder.endpoint must be an http(s) URL, got '{endpoint}'"),
        });
    }

    Ok(EmbedderSettings {
        endpoint: embedder.endpoint.clone(),
        dimension: embedder.dimension,
        timeout: Duration::from_secs(embedder.timeout_secs),
    })
}

fn validate_pipeline(config: &Config) -> Result<PipelineSettings> {
    let pipeline = &config.pipeline;

    if pipeline.concurrency == 0 {
        return Err(Error::ConfigValidation {
            message: "concurrency must be at least 1".to_string(),
        });
    }

    if pipeline.max_attempts == 0 {
        return Err(Error::ConfigValidation {
            message: "max_attempts must be at least 1".to_string(),
        });
    }

    Ok(PipelineSettings {
        concurrency: pipeline.concurrency,
        max_attempts: pipeline.max_attempts,
        retry_backoff: Duration::from_millis(pipeline.retry_backoff_ms),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::template()
    }

    #[test]
    fn test_validate_template_config() {
        let settings = build_settings(&valid_config()).unwrap();
        assert_eq!(settings.resolution.similarity_threshold, 0.85);
        assert_eq!(settings.resolution.burst_window, Duration::from_secs(5));
        assert_eq!(settings.pipeline.concurrency, 8);
    }

    #[test]
    fn test_missing_similarity_threshold_fails() {
        let config = Config::default();
        let err = build_settings(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = valid_config();
        config.resolution.similarity_threshold = Some(1.5);
        assert!(build_settings(&config).is_err());

        let mut config = valid_config();
        config.resolution.iou_threshold = -0.1;
        assert!(build_settings(&config).is_err());
    }

    #[test]
    fn test_incomplete_partition_table_fails() {
        let mut config = valid_config();
        config.partitions.remove("non-target");
        let err = build_settings(&config).unwrap_err();
        assert!(matches!(err, Error::PartitionMappingIncomplete { .. }));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = valid_config();
        config.pipeline.concurrency = 0;
        assert!(build_settings(&config).is_err());

        let mut config = valid_config();
        config.pipeline.max_attempts = 0;
        assert!(build_settings(&config).is_err());

        let mut config = valid_config();
        config.resolution.burst_window_secs = 0;
        assert!(build_settings(&config).is_err());

        let mut config = valid_config();
        config.embedder.dimension = 0;
        assert!(build_settings(&config).is_err());
    }

    #[test]
    fn test_endpoint_must_be_http() {
        let mut config = valid_config();
        config.embedder.endpoint = Some("ftp://models".to_string());
        assert!(build_settings(&config).is_err());

        config.embedder.endpoint = Some("http://localhost:8080/embed".to_string());
        assert!(build_settings(&config).is_ok());
    }
}
