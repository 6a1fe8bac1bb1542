//! Run orchestration: build images once, run scenarios concurrently, clean up.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vault_cloud::ComputeProvider;

use super::{run_scenario, GatewayFactory, ImageKind, Images, RunContext, Scenario};
use crate::config::{HarnessConfig, Secret};
use crate::stage::{self, run_stage, FileStageStore, StageStore};
use crate::tools::{ImageBuildRequest, ImageBuilder, Provisioner};
use crate::ui;

const SAVED_GCP_PROJECT_ID: &str = "GcpProjectId";
const SAVED_GCP_REGION_NAME: &str = "GcpRegionName";
const SAVED_GCP_ZONE_NAME: &str = "GcpZoneName";
const SAVED_OPEN_SOURCE_IMAGE: &str = "ImageOpenSourceVault";
const SAVED_ENTERPRISE_IMAGE: &str = "ImageEnterpriseVault";

/// Environment variable the image build reads the enterprise binary URL from.
const VAULT_DOWNLOAD_URL_ENV: &str = "VAULT_DOWNLOAD_URL";

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project_id: String,
    pub region: String,
    pub zone: String,
    /// Download URL of the enterprise Vault package.
    pub enterprise_download_url: Option<Secret>,
    /// Scenarios to run.
    pub scenarios: Vec<Scenario>,
}

impl RunSettings {
    fn needs_enterprise(&self) -> bool {
        self.scenarios
            .iter()
            .any(|s| s.image() == ImageKind::Enterprise)
    }
}

/// Result of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    /// Rendered error chain, if the scenario failed.
    pub error: Option<String>,
}

impl ScenarioOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One entry per scenario, in [`Scenario::ALL`] order.
    pub outcomes: Vec<ScenarioOutcome>,
    /// Image cleanup failure, if any.
    pub cleanup_error: Option<String>,
}

impl RunReport {
    /// Whether every scenario passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(ScenarioOutcome::passed)
    }
}

/// Drives a full test run.
pub struct Harness {
    config: HarnessConfig,
    compute: Arc<dyn ComputeProvider>,
    images: Arc<dyn ImageBuilder>,
    provisioner: Arc<dyn Provisioner>,
    gateways: GatewayFactory,
    store: FileStageStore,
}

impl Harness {
    /// Create a harness. Stage values go under `store`, one sub-directory
    /// per scenario.
    pub fn new(
        config: HarnessConfig,
        compute: Arc<dyn ComputeProvider>,
        images: Arc<dyn ImageBuilder>,
        provisioner: Arc<dyn Provisioner>,
        gateways: GatewayFactory,
        store: FileStageStore,
    ) -> Self {
        Self {
            config,
            compute,
            images,
            provisioner,
            gateways,
            store,
        }
    }

    /// Build images, run every selected scenario, then delete the images.
    ///
    /// # Errors
    /// Fails if images cannot be built or the run context cannot be
    /// assembled. Scenario failures are reported in the [`RunReport`].
    pub async fn run(&self, settings: &RunSettings) -> Result<RunReport> {
        if settings.scenarios.is_empty() {
            bail!("no scenarios selected");
        }

        let outcomes = async {
            ui::print_section("Building images");
            run_stage("build_images", || self.build_images(settings)).await?;
            let ctx = Arc::new(self.context()?);

            ui::print_section("Running scenarios");
            Ok::<_, anyhow::Error>(self.run_scenarios(ctx, &settings.scenarios).await)
        }
        .await;

        ui::print_section("Cleaning up");
        let cleanup = run_stage("delete_images", || self.delete_images()).await;

        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(e) => {
                if let Err(c) = &cleanup {
                    error!(error = format!("{c:#}"), "Image cleanup failed");
                }
                return Err(e);
            }
        };

        let cleanup_error = cleanup.err().map(|e| format!("{e:#}"));
        if let Some(e) = &cleanup_error {
            error!(error = %e, "Image cleanup failed");
        }

        Ok(RunReport {
            outcomes,
            cleanup_error,
        })
    }

    async fn build_images(&self, settings: &RunSettings) -> Result<()> {
        let store = &self.store;
        stage::save(store, SAVED_GCP_PROJECT_ID, &settings.project_id)?;
        stage::save(store, SAVED_GCP_REGION_NAME, &settings.region)?;
        stage::save(store, SAVED_GCP_ZONE_NAME, &settings.zone)?;

        let open_source = self.image_request(settings)?;
        let enterprise = if settings.needs_enterprise() {
            let url = settings
                .enterprise_download_url
                .clone()
                .context("an enterprise scenario was selected but no enterprise download URL is set")?;
            let mut request = open_source.clone();
            request.env.insert(VAULT_DOWNLOAD_URL_ENV.to_string(), url);
            Some(request)
        } else {
            None
        };

        // Ids from an earlier run belong to images that run already owned.
        stage::clear(store, &[SAVED_OPEN_SOURCE_IMAGE, SAVED_ENTERPRISE_IMAGE])?;

        let build_enterprise = async {
            match &enterprise {
                Some(request) => self.images.build(request).await.map(Some),
                None => Ok(None),
            }
        };
        let (open_source, enterprise) = tokio::join!(self.images.build(&open_source), build_enterprise);

        // Record every image that was built, so cleanup finds it even when
        // the other build failed.
        if let Ok(image) = &open_source {
            stage::save(store, SAVED_OPEN_SOURCE_IMAGE, image)?;
        }
        if let Ok(Some(image)) = &enterprise {
            stage::save(store, SAVED_ENTERPRISE_IMAGE, image)?;
        }

        let open_source = open_source.context("Failed to build Vault images")?;
        enterprise.context("Failed to build Vault images")?;
        ui::print_success(&format!("Images ready: {open_source}"));
        Ok(())
    }

    fn image_request(&self, settings: &RunSettings) -> Result<ImageBuildRequest> {
        let tls = &self.config.tls;
        let vars = BTreeMap::from([
            ("project_id".to_string(), settings.project_id.clone()),
            ("zone".to_string(), settings.zone.clone()),
            ("ca_public_key_path".to_string(), absolute(&tls.ca_public_key_path)?),
            ("tls_public_key_path".to_string(), absolute(&tls.tls_public_key_path)?),
            ("tls_private_key_path".to_string(), absolute(&tls.tls_private_key_path)?),
        ]);

        Ok(ImageBuildRequest {
            template: self.config.template_path(),
            build_name: self.config.packer_build_name.clone(),
            vars,
            env: BTreeMap::new(),
        })
    }

    /// Assemble the shared context from saved values.
    fn context(&self) -> Result<RunContext> {
        let store = &self.store;
        let images = Images {
            open_source: stage::load(store, SAVED_OPEN_SOURCE_IMAGE)?,
            enterprise: stage::load(store, SAVED_ENTERPRISE_IMAGE).ok(),
        };

        Ok(RunContext {
            project_id: stage::load(store, SAVED_GCP_PROJECT_ID)?,
            region: stage::load(store, SAVED_GCP_REGION_NAME)?,
            zone: stage::load(store, SAVED_GCP_ZONE_NAME)?,
            config: self.config.clone(),
            images,
            compute: Arc::clone(&self.compute),
            provisioner: Arc::clone(&self.provisioner),
            gateways: Arc::clone(&self.gateways),
        })
    }

    async fn run_scenarios(&self, ctx: Arc<RunContext>, scenarios: &[Scenario]) -> Vec<ScenarioOutcome> {
        let mut set = JoinSet::new();
        let mut ids = HashMap::new();

        for &scenario in Scenario::ALL.iter().filter(|s| scenarios.contains(s)) {
            let ctx = Arc::clone(&ctx);
            let store: Arc<dyn StageStore> = Arc::new(self.store.scoped(scenario.name()));
            ui::print_step(&format!("Starting {scenario}"));

            let handle = set.spawn(async move { run_scenario(ctx, scenario, store).await });
            ids.insert(handle.id(), scenario);
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        while let Some(result) = set.join_next_with_id().await {
            let (id, error) = match result {
                Ok((id, Ok(()))) => (id, None),
                Ok((id, Err(e))) => (id, Some(format!("{e:#}"))),
                Err(e) => (e.id(), Some(format!("scenario task panicked: {e}"))),
            };
            let Some(&scenario) = ids.get(&id) else {
                warn!(task = %id, "Unknown scenario task finished");
                continue;
            };

            ui::print_outcome(scenario.name(), error.is_none(), error.as_deref().unwrap_or("passed"));
            outcomes.push(ScenarioOutcome { scenario, error });
        }

        outcomes.sort_by_key(|o| Scenario::ALL.iter().position(|s| *s == o.scenario));
        outcomes
    }

    async fn delete_images(&self) -> Result<()> {
        let images: Vec<String> = [SAVED_OPEN_SOURCE_IMAGE, SAVED_ENTERPRISE_IMAGE]
            .into_iter()
            .filter_map(|key| stage::load(&self.store, key).ok())
            .collect();
        if images.is_empty() {
            warn!("No images recorded, nothing to delete");
            return Ok(());
        }

        let mut failures = Vec::new();
        for image in &images {
            match self.compute.delete_image(image).await {
                Ok(()) => info!(image = %image, "Deleted image"),
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to delete image");
                    failures.push(format!("{image}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to delete images: {}", failures.join("; ")))
        }
    }
}

fn absolute(path: &Path) -> Result<String> {
    let path: PathBuf = std::path::absolute(path)
        .with_context(|| format!("Cannot resolve {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}
