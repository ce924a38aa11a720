//! Recipe Composer: ordered components plus a base image, published as an
//! immutable `(name, version)` identity.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use ueps_state::ContentDigest;

use crate::component::{parse_version, Component, ComponentRegistry};
use crate::config::AccountScope;
use crate::domain::digest::{compute_digest, to_canonical_json};
use crate::domain::error::{Result, UepsError};

/// Pin text meaning "latest published version".
pub const LATEST_PIN: &str = "x.x.x";

/// Base image version pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionPin {
    Exact(Version),
    /// `x.x.x`: resolved at each pipeline evaluation.
    Latest,
}

impl VersionPin {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim() == LATEST_PIN {
            Ok(VersionPin::Latest)
        } else {
            parse_version(value).map(VersionPin::Exact)
        }
    }
}

impl TryFrom<String> for VersionPin {
    type Error = UepsError;

    fn try_from(value: String) -> Result<Self> {
        VersionPin::parse(&value)
    }
}

impl From<VersionPin> for String {
    fn from(pin: VersionPin) -> String {
        pin.to_string()
    }
}

impl fmt::Display for VersionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPin::Exact(v) => write!(f, "{v}"),
            VersionPin::Latest => f.write_str(LATEST_PIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseImageRef {
    pub name: String,
    pub pin: VersionPin,
}

impl BaseImageRef {
    pub fn new(name: impl Into<String>, pin: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            pin: VersionPin::parse(pin)?,
        })
    }

    pub fn arn(&self, scope: &AccountScope) -> String {
        scope.aws_owned_arn("imagebuilder", &format!("image/{}/{}", self.name, self.pin))
    }
}

/// Reference to a published component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub version: Version,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, version: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            version: parse_version(version)?,
        })
    }
}

impl From<&Component> for ComponentRef {
    fn from(c: &Component) -> Self {
        Self {
            name: c.name.clone(),
            version: c.version.clone(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Immutable recipe. Component order is install order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub version: Version,
    pub components: Vec<ComponentRef>,
    pub base_image: BaseImageRef,
}

impl Recipe {
    /// Deterministic serialized form; equal recipes render byte-identically.
    pub fn to_canonical_json(&self) -> Result<String> {
        to_canonical_json(self)
    }

    pub fn digest(&self) -> Result<ContentDigest> {
        compute_digest(self)
    }

    pub fn arn(&self, scope: &AccountScope) -> String {
        scope.arn(
            "imagebuilder",
            &format!("image-recipe/{}/{}", self.name.to_lowercase(), self.version),
        )
    }

    /// Describe how `other` differs, or `None` when contents are equal.
    fn difference(&self, other: &Recipe) -> Option<String> {
        if self.components != other.components {
            let ours: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
            let theirs: Vec<String> = other.components.iter().map(|c| c.to_string()).collect();
            return Some(format!(
                "components [{}] vs [{}]",
                ours.join(", "),
                theirs.join(", ")
            ));
        }
        if self.base_image != other.base_image {
            return Some(format!(
                "base image {}/{} vs {}/{}",
                self.base_image.name, self.base_image.pin, other.base_image.name, other.base_image.pin
            ));
        }
        None
    }
}

/// Composes and publishes recipes against a component registry.
#[derive(Debug, Clone)]
pub struct RecipeComposer {
    scope: AccountScope,
    registry: ComponentRegistry,
    published: BTreeMap<(String, Version), Recipe>,
}

impl RecipeComposer {
    pub fn new(scope: AccountScope, registry: ComponentRegistry) -> Self {
        Self {
            scope,
            registry,
            published: BTreeMap::new(),
        }
    }

    pub fn scope(&self) -> &AccountScope {
        &self.scope
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Components are published through the composer so recipes and their
    /// components share one registry.
    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    /// Load a recipe published by an earlier run. Later composes of the
    /// same identity must match it.
    pub fn restore(&mut self, recipe: Recipe) -> Result<()> {
        let key = (recipe.name.clone(), recipe.version.clone());
        if let Some(existing) = self.published.get(&key) {
            if let Some(detail) = existing.difference(&recipe) {
                return Err(UepsError::VersionConflict {
                    name: recipe.name,
                    version: recipe.version.to_string(),
                    detail,
                });
            }
            return Ok(());
        }
        debug!(recipe = %recipe.name, version = %recipe.version, "recipe restored");
        self.published.insert(key, recipe);
        Ok(())
    }

    /// Compose and publish a recipe.
    ///
    /// The component list must be non-empty, reference published components
    /// and name each component once; its order is kept exactly. Republishing
    /// an identity with different contents fails with `VersionConflict`;
    /// identical contents return the published recipe.
    #[instrument(skip(self, components, base_image), fields(components = components.len()))]
    pub fn compose(
        &mut self,
        name: &str,
        version: &str,
        components: &[ComponentRef],
        base_image: BaseImageRef,
    ) -> Result<Recipe> {
        let version = parse_version(version)?;

        if components.is_empty() {
            return Err(UepsError::EmptyRecipe {
                recipe: name.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for component in components {
            if !seen.insert(component.name.as_str()) {
                return Err(UepsError::DuplicateComponent {
                    recipe: name.to_string(),
                    component: component.name.clone(),
                });
            }
            if self.registry.get(&component.name, &component.version).is_none() {
                return Err(UepsError::UnknownComponent {
                    name: component.name.clone(),
                    version: component.version.to_string(),
                });
            }
        }

        let recipe = Recipe {
            name: name.to_string(),
            version: version.clone(),
            components: components.to_vec(),
            base_image,
        };

        let key = (name.to_string(), version);
        if let Some(existing) = self.published.get(&key) {
            return match existing.difference(&recipe) {
                None => {
                    debug!(recipe = %name, version = %recipe.version, "idempotent recipe compose");
                    Ok(existing.clone())
                }
                Some(detail) => Err(UepsError::VersionConflict {
                    name: recipe.name,
                    version: recipe.version.to_string(),
                    detail,
                }),
            };
        }

        info!(
            recipe = %recipe.name,
            version = %recipe.version,
            arn = %recipe.arn(&self.scope),
            "recipe published"
        );
        self.published.insert(key, recipe.clone());
        Ok(recipe)
    }

    /// Compose from component names, each at its latest published version.
    pub fn compose_latest(
        &mut self,
        name: &str,
        version: &str,
        component_names: &[&str],
        base_image: BaseImageRef,
    ) -> Result<Recipe> {
        let refs = component_names
            .iter()
            .map(|n| {
                self.registry
                    .latest(n)
                    .map(ComponentRef::from)
                    .ok_or_else(|| UepsError::UnknownComponent {
                        name: n.to_string(),
                        version: "latest".to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.compose(name, version, &refs, base_image)
    }

    pub fn get(&self, name: &str, version: &Version) -> Option<&Recipe> {
        self.published.get(&(name.to_string(), version.clone()))
    }

    /// Resolve a recipe's references to the published components, in order.
    pub fn components_of(&self, recipe: &Recipe) -> Result<Vec<&Component>> {
        recipe
            .components
            .iter()
            .map(|r| {
                self.registry
                    .get(&r.name, &r.version)
                    .ok_or_else(|| UepsError::UnknownComponent {
                        name: r.name.clone(),
                        version: r.version.to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDocument, Platform};

    fn doc(step: &str) -> ComponentDocument {
        ComponentDocument::parse(&format!(
            "name: doc\nschemaVersion: 1.0\nphases:\n  - name: build\n    steps:\n      - name: {step}\n        action: ExecutePowerShell\n"
        ))
        .unwrap()
    }

    fn composer() -> RecipeComposer {
        let mut registry = ComponentRegistry::new();
        registry
            .register("nvidia", Platform::Windows, "0.0.5", doc("driver"))
            .unwrap();
        registry
            .register("nice-dcv", Platform::Windows, "0.0.5", doc("dcv"))
            .unwrap();
        RecipeComposer::new(AccountScope::new("us-east-1", "123456789012"), registry)
    }

    fn refs(names: &[&str]) -> Vec<ComponentRef> {
        names
            .iter()
            .map(|n| ComponentRef::new(*n, "0.0.5").unwrap())
            .collect()
    }

    fn base() -> BaseImageRef {
        BaseImageRef::new("windows-server-2019-full-base", "x.x.x").unwrap()
    }

    #[test]
    fn test_compose_preserves_order_and_is_deterministic() {
        let mut a = composer();
        let mut b = composer();
        let r1 = a.compose("r", "1.0.0", &refs(&["nvidia", "nice-dcv"]), base()).unwrap();
        let r2 = b.compose("r", "1.0.0", &refs(&["nvidia", "nice-dcv"]), base()).unwrap();
        assert_eq!(r1.components[0].name, "nvidia");
        assert_eq!(r1.to_canonical_json().unwrap(), r2.to_canonical_json().unwrap());
        assert_eq!(r1.digest().unwrap(), r2.digest().unwrap());
    }

    #[test]
    fn test_compose_order_is_significant() {
        let mut c = composer();
        let r1 = c.compose("a", "1.0.0", &refs(&["nvidia", "nice-dcv"]), base()).unwrap();
        let r2 = c.compose("b", "1.0.0", &refs(&["nice-dcv", "nvidia"]), base()).unwrap();
        assert_ne!(r1.components, r2.components);
    }

    #[test]
    fn test_compose_empty_rejected() {
        let err = composer().compose("r", "1.0.0", &[], base()).unwrap_err();
        assert!(matches!(err, UepsError::EmptyRecipe { .. }));
    }

    #[test]
    fn test_compose_duplicate_component_rejected() {
        let err = composer()
            .compose("r", "1.0.0", &refs(&["nvidia", "nvidia"]), base())
            .unwrap_err();
        assert!(matches!(err, UepsError::DuplicateComponent { .. }));
    }

    #[test]
    fn test_compose_unknown_component_rejected() {
        let err = composer()
            .compose("r", "1.0.0", &refs(&["nvidia", "cuda"]), base())
            .unwrap_err();
        assert!(matches!(err, UepsError::UnknownComponent { ref name, .. } if name == "cuda"));
    }

    #[test]
    fn test_republish_same_identity() {
        let mut c = composer();
        c.compose("r", "1.0.0", &refs(&["nvidia"]), base()).unwrap();
        // identical contents: idempotent
        c.compose("r", "1.0.0", &refs(&["nvidia"]), base()).unwrap();

        let err = c
            .compose("r", "1.0.0", &refs(&["nvidia", "nice-dcv"]), base())
            .unwrap_err();
        assert!(matches!(err, UepsError::VersionConflict { .. }));

        let pinned = BaseImageRef::new("windows-server-2019-full-base", "2024.1.0").unwrap();
        let err = c.compose("r", "1.0.0", &refs(&["nvidia"]), pinned).unwrap_err();
        assert!(err.to_string().contains("base image"));
    }

    #[test]
    fn test_restored_recipe_guards_next_compose() {
        let published = composer()
            .compose("r", "1.0.0", &refs(&["nvidia"]), base())
            .unwrap();

        let mut next = composer();
        next.restore(published.clone()).unwrap();
        next.restore(published.clone()).unwrap();
        assert_eq!(next.get("r", &Version::new(1, 0, 0)), Some(&published));
        assert_eq!(next.compose("r", "1.0.0", &refs(&["nvidia"]), base()).unwrap(), published);

        let err = next
            .compose("r", "1.0.0", &refs(&["nvidia", "nice-dcv"]), base())
            .unwrap_err();
        assert!(matches!(err, UepsError::VersionConflict { ref detail, .. } if detail.contains("nice-dcv")));
    }

    #[test]
    fn test_compose_latest_picks_highest_version() {
        let mut c = composer();
        c.registry_mut()
            .register("nvidia", Platform::Windows, "0.0.6", doc("driver-2"))
            .unwrap();
        let r = c
            .compose_latest("r", "1.0.0", &["nvidia", "nice-dcv"], base())
            .unwrap();
        assert_eq!(r.components[0].version, Version::new(0, 0, 6));
    }

    #[test]
    fn test_version_pin_serde() {
        let latest: VersionPin = serde_json::from_str("\"x.x.x\"").unwrap();
        assert_eq!(latest, VersionPin::Latest);
        let exact: VersionPin = serde_json::from_str("\"2024.1.0\"").unwrap();
        assert_eq!(exact, VersionPin::Exact(Version::new(2024, 1, 0)));
        assert_eq!(serde_json::to_string(&latest).unwrap(), "\"x.x.x\"");
        assert!(serde_json::from_str::<VersionPin>("\"latest\"").is_err());
    }

    #[test]
    fn test_recipe_and_base_arns() {
        let scope = AccountScope::new("us-east-1", "123456789012");
        let mut c = composer();
        let r = c.compose("UEPSWindowsImageRecipe", "1.0.5", &refs(&["nvidia"]), base()).unwrap();
        assert_eq!(
            r.arn(&scope),
            "arn:aws:imagebuilder:us-east-1:123456789012:image-recipe/uepswindowsimagerecipe/1.0.5"
        );
        assert_eq!(
            r.base_image.arn(&scope),
            "arn:aws:imagebuilder:us-east-1:aws:image/windows-server-2019-full-base/x.x.x"
        );
    }
}
