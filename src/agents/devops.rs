//! Container and CI scaffolding for generated test projects.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::agents::{project_dir, write_files, GeneratedFile};
use crate::agents::parser::DEFAULT_BASE_URL;
use crate::core::project::{slugify, Language};
use crate::orchestration::{AgentInput, AgentOutput, Capability, CapabilityProvider, ProviderError};

pub fn render(language: Language, project_name: &str, base_url: &str) -> Vec<GeneratedFile> {
    let slug = slugify(project_name);
    let (dockerfile, test_command, setup_step) = match language {
        Language::Java => (
            "FROM maven:3.9-eclipse-temurin-17\n\
             WORKDIR /tests\n\
             COPY pom.xml .\n\
             RUN mvn -q dependency:go-offline\n\
             COPY src ./src\n\
             ENTRYPOINT [\"mvn\", \"-q\", \"test\"]\n",
            "mvn -q test -Denv=${TEST_ENV:-dev}",
            "      - uses: actions/setup-java@v4\n        with:\n          distribution: temurin\n          java-version: '17'\n",
        ),
        Language::Python => (
            "FROM python:3.12-slim\n\
             WORKDIR /tests\n\
             COPY requirements.txt .\n\
             RUN pip install --no-cache-dir -r requirements.txt\n\
             COPY . .\n\
             ENTRYPOINT [\"pytest\"]\n",
            "pip install -r requirements.txt && pytest",
            "      - uses: actions/setup-python@v5\n        with:\n          python-version: '3.12'\n",
        ),
    };
    let compose_base_url = if base_url == DEFAULT_BASE_URL {
        "http://host.docker.internal:8080"
    } else {
        base_url
    };

    vec![
        GeneratedFile::new("Dockerfile", dockerfile, "test runner image"),
        GeneratedFile::new(
            ".dockerignore",
            "target/\n.pytest_cache/\n__pycache__/\n*.log\n",
            "docker build context filter",
        ),
        GeneratedFile::new(
            "docker-compose.yml",
            format!(
                "services:\n  {slug}-tests:\n    build: .\n    environment:\n      TEST_ENV: ${{TEST_ENV:-dev}}\n      API_BASE_URL: {url}\n      API_TOKEN: ${{API_TOKEN:-}}\n    extra_hosts:\n      - \"host.docker.internal:host-gateway\"\n",
                slug = slug,
                url = compose_base_url,
            ),
            "compose service",
        ),
        GeneratedFile::new(
            ".github/workflows/api-tests.yml",
            format!(
                "name: api-tests\n\non:\n  push:\n  workflow_dispatch:\n\njobs:\n  test:\n    runs-on: ubuntu-latest\n    strategy:\n      matrix:\n        env: [dev, staging]\n    steps:\n      - uses: actions/checkout@v4\n{setup}      - name: Run tests\n        env:\n          TEST_ENV: ${{{{ matrix.env }}}}\n          API_TOKEN: ${{{{ secrets.API_TOKEN }}}}\n        run: {command}\n",
                setup = setup_step,
                command = test_command,
            ),
            "CI workflow",
        ),
    ]
}

/// Provider for [`Capability::DevopsGeneration`].
pub struct DevopsProvider {
    output_dir: PathBuf,
}

impl DevopsProvider {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl CapabilityProvider for DevopsProvider {
    fn capability(&self) -> Capability {
        Capability::DevopsGeneration
    }

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput, ProviderError> {
        let base_url = input
            .output_of(Capability::Parse)
            .and_then(|parsed| parsed.get("base_url"))
            .and_then(|url| url.as_str())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string();
        let dir = project_dir(input, &self.output_dir);
        let files = render(input.config.language, &input.project_name, &base_url);
        let artifacts = write_files(&dir, &files).await?;

        let docker = which::which("docker").ok();
        debug!(docker = ?docker, "docker lookup");
        info!(
            project = %input.project_id,
            files = artifacts.len(),
            docker_available = docker.is_some(),
            "devops scaffolding generated"
        );
        let payload = json!({
            "directory": dir.display().to_string(),
            "files": artifacts.len(),
            "docker_available": docker.is_some(),
        });
        Ok(AgentOutput::new(payload).with_artifacts(artifacts))
    }
}
