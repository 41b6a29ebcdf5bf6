//! Test framework generation.
//!
//! Renders a Maven + TestNG + RestAssured project for Java or a pytest +
//! requests project for Python from the parsed API description. One test
//! module is generated per endpoint group and one configuration file per
//! environment.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::agents::parser::{identifier, ApiDescription, Endpoint, Scenario, ScenarioKind};
use crate::agents::{parsed_api, pascal_case, project_dir, write_files, GeneratedFile};
use crate::core::project::{Language, ProjectConfig};
use crate::orchestration::{AgentInput, AgentOutput, Capability, CapabilityProvider, ProviderError};

/// Endpoints keyed by [`Endpoint::group`], in stable order.
pub fn group_endpoints(api: &ApiDescription) -> BTreeMap<String, Vec<&Endpoint>> {
    let mut groups: BTreeMap<String, Vec<&Endpoint>> = BTreeMap::new();
    for endpoint in &api.endpoints {
        groups.entry(endpoint.group()).or_default().push(endpoint);
    }
    groups
}

/// Base URL for one environment. Production keeps the declared host; other
/// environments get an `<env>.` subdomain on absolute https URLs.
pub fn environment_url(base_url: &str, environment: &str) -> String {
    match base_url.strip_prefix("https://") {
        Some(rest) if environment != "prod" => format!("https://{}.{}", environment, rest),
        _ => base_url.to_string(),
    }
}

/// Concrete request path with every `{param}` filled in.
fn concrete_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut in_param = false;
    for c in path.chars() {
        match c {
            '{' => {
                in_param = true;
                out.push('1');
            }
            '}' => in_param = false,
            _ if !in_param => out.push(c),
            _ => {}
        }
    }
    out
}

pub fn render(api: &ApiDescription, project_name: &str, config: &ProjectConfig) -> Vec<GeneratedFile> {
    match config.language {
        Language::Java => render_java(api, project_name, config),
        Language::Python => render_python(api, project_name, config),
    }
}

fn java_package(project_name: &str) -> String {
    format!("com.{}", identifier(project_name))
}

fn camel_case(name: &str) -> String {
    let pascal = pascal_case(name);
    let mut chars = pascal.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => "scenario".to_string(),
    }
}

fn java_string(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_java(api: &ApiDescription, project_name: &str, config: &ProjectConfig) -> Vec<GeneratedFile> {
    let package = java_package(project_name);
    let package_path = package.replace('.', "/");
    let artifact_id = crate::core::project::slugify(project_name);
    let groups = group_endpoints(api);
    let mut files = Vec::new();

    files.push(GeneratedFile::new(
        "pom.xml",
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<project xmlns="http://maven.apache.org/POM/4.0.0"
         xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
         xsi:schemaLocation="http://maven.apache.org/POM/4.0.0 http://maven.apache.org/xsd/maven-4.0.0.xsd">
    <modelVersion>4.0.0</modelVersion>

    <groupId>{package}</groupId>
    <artifactId>{artifact_id}</artifactId>
    <version>1.0.0</version>
    <packaging>jar</packaging>

    <properties>
        <maven.compiler.source>11</maven.compiler.source>
        <maven.compiler.target>11</maven.compiler.target>
        <project.build.sourceEncoding>UTF-8</project.build.sourceEncoding>
        <restassured.version>5.3.2</restassured.version>
        <testng.version>7.8.0</testng.version>
        <env>dev</env>
    </properties>

    <dependencies>
        <dependency>
            <groupId>io.rest-assured</groupId>
            <artifactId>rest-assured</artifactId>
            <version>${{restassured.version}}</version>
            <scope>test</scope>
        </dependency>
        <dependency>
            <groupId>org.testng</groupId>
            <artifactId>testng</artifactId>
            <version>${{testng.version}}</version>
            <scope>test</scope>
        </dependency>
    </dependencies>

    <build>
        <plugins>
            <plugin>
                <groupId>org.apache.maven.plugins</groupId>
                <artifactId>maven-surefire-plugin</artifactId>
                <version>3.1.2</version>
                <configuration>
                    <suiteXmlFiles>
                        <suiteXmlFile>src/test/resources/testng.xml</suiteXmlFile>
                    </suiteXmlFiles>
                    <systemPropertyVariables>
                        <env>${{env}}</env>
                    </systemPropertyVariables>
                </configuration>
            </plugin>
        </plugins>
    </build>
</project>
"#
        ),
        "Maven build",
    ));

    for env in &config.environments {
        files.push(GeneratedFile::new(
            format!("src/test/resources/{}-config.properties", env),
            format!(
                "# {env} environment\napi.base.url={url}\napi.timeout=30000\nauth.type={auth}\nauth.token=${{API_TOKEN}}\n",
                env = env,
                url = environment_url(&api.base_url, env),
                auth = api.auth.kind,
            ),
            format!("{} configuration", env),
        ));
    }

    let classes: Vec<String> = groups
        .keys()
        .map(|group| format!("{}.tests.{}ApiTest", package, pascal_case(group)))
        .collect();
    let class_entries: String = classes
        .iter()
        .map(|class| format!("            <class name=\"{}\"/>\n", class))
        .collect();
    files.push(GeneratedFile::new(
        "src/test/resources/testng.xml",
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE suite SYSTEM \"https://testng.org/testng-1.0.dtd\">\n<suite name=\"{title}\">\n    <test name=\"api\">\n        <classes>\n{classes}        </classes>\n    </test>\n</suite>\n",
            title = java_string(&api.title),
            classes = class_entries,
        ),
        "TestNG suite",
    ));

    files.push(GeneratedFile::new(
        format!("src/test/java/{}/base/BaseTest.java", package_path),
        format!(
            r#"package {package}.base;

import io.restassured.RestAssured;
import io.restassured.specification.RequestSpecification;
import java.io.InputStream;
import java.util.Properties;
import org.testng.annotations.BeforeClass;

public abstract class BaseTest {{
    protected Properties config = new Properties();

    @BeforeClass
    public void loadConfig() throws Exception {{
        String env = System.getProperty("env", "dev");
        try (InputStream in = getClass().getClassLoader().getResourceAsStream(env + "-config.properties")) {{
            config.load(in);
        }}
        RestAssured.baseURI = config.getProperty("api.base.url");
    }}

    protected RequestSpecification anonymous() {{
        return RestAssured.given().contentType("application/json");
    }}

    protected RequestSpecification authorized() {{
        String token = System.getenv("API_TOKEN");
        RequestSpecification spec = anonymous();
        return token == null ? spec : spec.header("Authorization", "Bearer " + token);
    }}
}}
"#
        ),
        "shared test setup",
    ));

    for (group, endpoints) in &groups {
        let class_name = format!("{}ApiTest", pascal_case(group));
        let methods: String = endpoints
            .iter()
            .flat_map(|e| e.scenarios.iter().map(move |s| java_test_method(e, s)))
            .collect();
        files.push(GeneratedFile::new(
            format!("src/test/java/{}/tests/{}.java", package_path, class_name),
            format!(
                "package {package}.tests;\n\nimport {package}.base.BaseTest;\nimport org.testng.annotations.Test;\n\npublic class {class_name} extends BaseTest {{\n{methods}}}\n",
                package = package,
                class_name = class_name,
                methods = methods,
            ),
            format!("tests for {}", group),
        ));
    }

    files
}

fn java_test_method(endpoint: &Endpoint, scenario: &Scenario) -> String {
    let spec = match scenario.kind {
        ScenarioKind::Negative if scenario.expected_status == Some(401) => "anonymous()",
        _ if endpoint.requires_auth => "authorized()",
        _ => "anonymous()",
    };
    let setup = if scenario.expected_status == Some(400) {
        ".queryParam(\"invalid\", \"%%%\")"
    } else {
        ""
    };
    let status = match scenario.expected_status {
        Some(status) => format!(".then().statusCode({})", status),
        None => ".then().log().ifValidationFails()".to_string(),
    };
    format!(
        "\n    @Test(description = \"{description}\")\n    public void {name}() {{\n        {spec}{setup}.when().request(\"{method}\", \"{path}\"){status};\n    }}\n",
        description = java_string(&scenario.description),
        name = camel_case(&scenario.name),
        spec = spec,
        setup = setup,
        method = endpoint.method,
        path = java_string(&concrete_path(&endpoint.path)),
        status = status,
    )
}

fn render_python(api: &ApiDescription, project_name: &str, config: &ProjectConfig) -> Vec<GeneratedFile> {
    let mut files = vec![
        GeneratedFile::new(
            "requirements.txt",
            "requests>=2.31.0\npytest>=7.4.0\n",
            "Python dependencies",
        ),
        GeneratedFile::new(
            "pytest.ini",
            format!(
                "[pytest]\ntestpaths = tests\npython_files = test_*.py\naddopts = -ra\nmarkers =\n    negative: expected-failure scenarios\n# {}\n",
                project_name
            ),
            "pytest settings",
        ),
        GeneratedFile::new("tests/__init__.py", "", "test package marker"),
        GeneratedFile::new(
            "conftest.py",
            r#"import json
import os
import pathlib

import pytest
import requests

CONFIG_DIR = pathlib.Path(__file__).parent / "config"


@pytest.fixture(scope="session")
def config():
    env = os.environ.get("TEST_ENV", "dev")
    return json.loads((CONFIG_DIR / f"{env}.json").read_text())


@pytest.fixture
def anonymous(config):
    session = requests.Session()
    session.headers["Content-Type"] = "application/json"
    session.base_url = config["base_url"]
    return session


@pytest.fixture
def authorized(anonymous):
    token = os.environ.get("API_TOKEN")
    if token:
        anonymous.headers["Authorization"] = f"Bearer {token}"
    return anonymous
"#,
            "shared fixtures",
        ),
    ];

    for env in &config.environments {
        let body = json!({
            "environment": env,
            "base_url": environment_url(&api.base_url, env),
            "timeout_seconds": 30,
            "auth": api.auth.kind,
        });
        files.push(GeneratedFile::new(
            format!("config/{}.json", env),
            serde_json::to_string_pretty(&body).unwrap_or_default() + "\n",
            format!("{} configuration", env),
        ));
    }

    for (group, endpoints) in group_endpoints(api) {
        let mut module = String::from("import pytest\n");
        for endpoint in endpoints {
            for scenario in &endpoint.scenarios {
                module.push_str(&python_test(endpoint, scenario));
            }
        }
        files.push(GeneratedFile::new(
            format!("tests/test_{}.py", group),
            module,
            format!("tests for {}", group),
        ));
    }

    files
}

fn python_test(endpoint: &Endpoint, scenario: &Scenario) -> String {
    let fixture = match scenario.expected_status {
        Some(401) => "anonymous",
        _ if endpoint.requires_auth => "authorized",
        _ => "anonymous",
    };
    let marker = if scenario.kind == ScenarioKind::Negative {
        "\n@pytest.mark.negative"
    } else {
        ""
    };
    let params = if scenario.expected_status == Some(400) {
        ", params={\"invalid\": \"%%%\"}"
    } else {
        ""
    };
    let assertion = match scenario.expected_status {
        Some(status) => format!("    assert response.status_code == {}\n", status),
        None => "    assert response.status_code < 500\n".to_string(),
    };
    let name = if scenario.name.starts_with("test_") {
        scenario.name.clone()
    } else {
        format!("test_{}", scenario.name)
    };
    format!(
        "\n{marker}\ndef {name}({fixture}):\n    \"\"\"{description}\"\"\"\n    response = {fixture}.request(\"{method}\", {fixture}.base_url + \"{path}\"{params})\n{assertion}",
        marker = marker,
        name = name,
        fixture = fixture,
        description = scenario.description.replace("\"\"\"", "'''"),
        method = endpoint.method,
        path = concrete_path(&endpoint.path).replace('"', "\\\""),
        params = params,
        assertion = assertion,
    )
}

/// Provider for [`Capability::FrameworkGeneration`].
pub struct FrameworkProvider {
    output_dir: PathBuf,
}

impl FrameworkProvider {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl CapabilityProvider for FrameworkProvider {
    fn capability(&self) -> Capability {
        Capability::FrameworkGeneration
    }

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput, ProviderError> {
        let api = parsed_api(input)?;
        if api.endpoints.is_empty() {
            return Err(ProviderError::InvalidInput(
                "API description declares no endpoints".to_string(),
            ));
        }
        let dir = project_dir(input, &self.output_dir);
        let files = render(&api, &input.project_name, &input.config);
        let artifacts = write_files(&dir, &files).await?;

        info!(
            project = %input.project_id,
            language = %input.config.language,
            files = artifacts.len(),
            dir = %dir.display(),
            "test framework generated"
        );
        let payload = json!({
            "language": input.config.language,
            "directory": dir.display().to_string(),
            "groups": group_endpoints(&api).keys().collect::<Vec<_>>(),
            "scenarios": api.scenario_count(),
            "files": artifacts.len(),
        });
        Ok(AgentOutput::new(payload).with_artifacts(artifacts))
    }
}
