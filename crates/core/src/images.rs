//! Image selection per container

use crate::errors::ConfigError;
use crate::task::TaskDescriptor;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Parse a `NAME=URI` image override
pub fn parse_image_override(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((name, uri)) if !name.is_empty() && !uri.is_empty() => {
            Ok((name.to_string(), uri.to_string()))
        }
        _ => Err(ConfigError::InvalidImageOverride {
            value: raw.to_string(),
        }),
    }
}

/// Pick the image for every descriptor container.
///
/// Freshly built images win; containers without one run the image declared in
/// the task definition. The result follows descriptor order.
pub fn resolve_images(
    built: &HashMap<String, String>,
    descriptor: &TaskDescriptor,
) -> Vec<(String, String)> {
    for name in built.keys() {
        if descriptor.container(name).is_none() {
            warn!("Ignoring image for {}: no such container in the task definition", name);
        }
    }

    descriptor
        .containers()
        .iter()
        .map(|c| {
            let image = match built.get(&c.name) {
                Some(uri) => {
                    debug!("Using built image {} for {}", uri, c.name);
                    uri.clone()
                }
                None => c.image.clone(),
            };
            (c.name.clone(), image)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ContainerSpec;

    #[test]
    fn test_built_images_win() {
        let task = TaskDescriptor::new(vec![
            ContainerSpec {
                name: "api".to_string(),
                image: "remote/api:1".to_string(),
                ..Default::default()
            },
            ContainerSpec {
                name: "sidecar".to_string(),
                image: "remote/sidecar:1".to_string(),
                ..Default::default()
            },
        ]);
        let built = HashMap::from([
            ("api".to_string(), "local/api:dev".to_string()),
            ("ghost".to_string(), "local/ghost:dev".to_string()),
        ]);

        let images = resolve_images(&built, &task);
        assert_eq!(
            images,
            vec![
                ("api".to_string(), "local/api:dev".to_string()),
                ("sidecar".to_string(), "remote/sidecar:1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_image_override() {
        assert_eq!(
            parse_image_override("api=local/api:dev").unwrap(),
            ("api".to_string(), "local/api:dev".to_string())
        );
        assert!(parse_image_override("api").is_err());
        assert!(parse_image_override("=img").is_err());
        assert!(parse_image_override("api=").is_err());
    }
}
