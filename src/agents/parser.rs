//! API description parsing.
//!
//! Accepts OpenAPI 3 / Swagger 2 documents (JSON or YAML), Postman
//! collections, and a loose YAML format with a top-level `endpoints` list.
//! Every format is normalized into an [`ApiDescription`] with derived test
//! scenarios per endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::orchestration::{
    classify, AgentInput, AgentOutcome, AgentOutput, Capability, CapabilityProvider,
    ProviderError, ReasoningClient,
};

/// Placeholder used when a document declares no server.
pub const DEFAULT_BASE_URL: &str = "${api.base.url}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Openapi,
    Swagger,
    Postman,
    GenericYaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub kind: ScenarioKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// `query`, `path`, `header` or `cookie`.
    pub location: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    pub operation_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub requires_auth: bool,
    pub success_status: u16,
    pub scenarios: Vec<Scenario>,
}

impl Endpoint {
    /// Group used to split generated test modules: first tag, else first
    /// path segment. Always lower-case alphanumeric.
    pub fn group(&self) -> String {
        let raw = match self.tags.first() {
            Some(tag) => tag.as_str(),
            None => self
                .path
                .split('/')
                .find(|s| !s.is_empty() && !s.starts_with('{'))
                .unwrap_or("api"),
        };
        let cleaned: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
            "api".to_string()
        } else {
            cleaned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Normalized kind: `none`, `basic`, `bearer`, `api_key`, `oauth2`.
    pub kind: String,
    #[serde(default)]
    pub schemes: Vec<String>,
}

impl Default for AuthInfo {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            schemes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDescription {
    pub format: SourceFormat,
    pub title: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    pub auth: AuthInfo,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub models: BTreeMap<String, Value>,
    /// Free-form suggestions from the reasoning command, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhancements: Option<Value>,
}

impl ApiDescription {
    pub fn scenario_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.scenarios.len()).sum()
    }
}

/// Parse the text of an API description. `path` is only used for its
/// extension.
pub fn parse_document(path: &Path, text: &str) -> Result<ApiDescription, ProviderError> {
    let document = load_value(path, text)?;
    let Some(root) = document.as_object() else {
        return Err(ProviderError::InvalidInput(
            "API description must be a mapping at the top level".to_string(),
        ));
    };

    if root.contains_key("openapi") || root.contains_key("swagger") {
        parse_openapi(root)
    } else if root.contains_key("info") && root.contains_key("item") {
        parse_postman(root)
    } else if root.get("endpoints").is_some_and(Value::is_array) {
        parse_generic(root)
    } else {
        Err(ProviderError::InvalidInput(format!(
            "{} is not an OpenAPI, Swagger or Postman document and has no endpoints list",
            path.display()
        )))
    }
}

fn load_value(path: &Path, text: &str) -> Result<Value, ProviderError> {
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidInput(format!("{} is empty", path.display())));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => serde_json::from_str(text)
            .map_err(|e| ProviderError::InvalidInput(format!("malformed JSON: {}", e))),
        Some("yaml") | Some("yml") => from_yaml(text),
        _ => serde_json::from_str(text).or_else(|_| from_yaml(text)),
    }
}

fn from_yaml(text: &str) -> Result<Value, ProviderError> {
    // Going through the YAML value keeps integer keys such as response codes.
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| ProviderError::InvalidInput(format!("malformed YAML: {}", e)))?;
    serde_json::to_value(yaml)
        .map_err(|e| ProviderError::InvalidInput(format!("unsupported YAML content: {}", e)))
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn info_field(root: &Map<String, Value>, key: &str, default: &str) -> String {
    root.get("info")
        .and_then(|info| str_at(info, key))
        .unwrap_or(default)
        .to_string()
}

const HTTP_METHODS: &[&str] = &["get", "put", "post", "delete", "patch", "head", "options"];

fn parse_openapi(root: &Map<String, Value>) -> Result<ApiDescription, ProviderError> {
    let format = if root.contains_key("openapi") {
        SourceFormat::Openapi
    } else {
        SourceFormat::Swagger
    };
    let global_security = root
        .get("security")
        .and_then(Value::as_array)
        .is_some_and(|s| !s.is_empty());

    let mut endpoints = Vec::new();
    if let Some(paths) = root.get("paths").and_then(Value::as_object) {
        for (path, item) in paths {
            let Some(item) = item.as_object() else { continue };
            let shared_params = item.get("parameters");
            for method in HTTP_METHODS {
                let Some(details) = item.get(*method) else { continue };
                endpoints.push(openapi_endpoint(path, method, details, shared_params, global_security));
            }
        }
    }

    let models = root
        .get("components")
        .and_then(|c| c.get("schemas"))
        .or_else(|| root.get("definitions"))
        .and_then(Value::as_object)
        .map(|schemas| schemas.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Ok(ApiDescription {
        format,
        title: info_field(root, "title", "API Tests"),
        version: info_field(root, "version", "1.0.0"),
        description: info_field(root, "description", ""),
        base_url: openapi_base_url(root),
        auth: openapi_auth(root),
        endpoints,
        models,
        enhancements: None,
    })
}

fn openapi_endpoint(
    path: &str,
    method: &str,
    details: &Value,
    shared_params: Option<&Value>,
    global_security: bool,
) -> Endpoint {
    let mut parameters: Vec<Parameter> = shared_params
        .into_iter()
        .chain(details.get("parameters"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|p| {
            Some(Parameter {
                name: str_at(p, "name")?.to_string(),
                location: str_at(p, "in").unwrap_or("query").to_string(),
                required: p.get("required").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect();
    parameters.dedup_by(|a, b| a.name == b.name && a.location == b.location);

    let requires_auth = match details.get("security").and_then(Value::as_array) {
        Some(requirements) => !requirements.is_empty(),
        None => global_security,
    };
    let responses: Vec<&str> = details
        .get("responses")
        .and_then(Value::as_object)
        .map(|r| r.keys().map(String::as_str).collect())
        .unwrap_or_default();
    let has_body = details.get("requestBody").is_some();

    let method = method.to_ascii_uppercase();
    let success_status = success_status(&method, &responses);
    let operation_id = str_at(details, "operationId")
        .map(str::to_string)
        .unwrap_or_else(|| identifier(&format!("{} {}", method, path)));
    let tags = details
        .get("tags")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut endpoint = Endpoint {
        scenarios: Vec::new(),
        method,
        path: path.to_string(),
        operation_id,
        summary: str_at(details, "summary").unwrap_or_default().to_string(),
        tags,
        parameters,
        requires_auth,
        success_status,
    };
    endpoint.scenarios = derive_scenarios(&endpoint, has_body);
    endpoint
}

fn openapi_base_url(root: &Map<String, Value>) -> String {
    if let Some(url) = root
        .get("servers")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
        .and_then(|s| str_at(s, "url"))
    {
        return url.to_string();
    }
    match root.get("host").and_then(Value::as_str) {
        Some(host) => {
            let scheme = root
                .get("schemes")
                .and_then(Value::as_array)
                .and_then(|s| s.first())
                .and_then(Value::as_str)
                .unwrap_or("https");
            let base_path = root.get("basePath").and_then(Value::as_str).unwrap_or("");
            format!("{}://{}{}", scheme, host, base_path)
        }
        None => DEFAULT_BASE_URL.to_string(),
    }
}

fn openapi_auth(root: &Map<String, Value>) -> AuthInfo {
    let schemes = root
        .get("components")
        .and_then(|c| c.get("securitySchemes"))
        .or_else(|| root.get("securityDefinitions"))
        .and_then(Value::as_object);
    let Some(schemes) = schemes.filter(|s| !s.is_empty()) else {
        return AuthInfo::default();
    };
    let kind = schemes
        .values()
        .next()
        .map(|first| {
            let declared = str_at(first, "type").unwrap_or("none");
            let scheme = str_at(first, "scheme").unwrap_or("");
            normalize_auth(declared, scheme)
        })
        .unwrap_or_else(|| "none".to_string());
    AuthInfo {
        kind,
        schemes: schemes.keys().cloned().collect(),
    }
}

fn normalize_auth(declared: &str, scheme: &str) -> String {
    match (declared.to_ascii_lowercase().as_str(), scheme.to_ascii_lowercase().as_str()) {
        ("http", "bearer") | ("bearer", _) => "bearer",
        ("http", _) | ("basic", _) => "basic",
        ("apikey", _) | ("api_key", _) => "api_key",
        ("oauth2", _) | ("openidconnect", _) => "oauth2",
        _ => "none",
    }
    .to_string()
}

fn parse_postman(root: &Map<String, Value>) -> Result<ApiDescription, ProviderError> {
    let auth_kind = root
        .get("auth")
        .and_then(|a| str_at(a, "type"))
        .map(|t| normalize_auth(t, ""))
        .unwrap_or_else(|| "none".to_string());
    let requires_auth = auth_kind != "none";

    let mut endpoints = Vec::new();
    if let Some(items) = root.get("item").and_then(Value::as_array) {
        collect_postman_items(items, requires_auth, &mut Vec::new(), &mut endpoints);
    }

    let base_url = root
        .get("variable")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|v| matches!(str_at(v, "key"), Some("baseUrl" | "base_url" | "host")))
        .and_then(|v| str_at(v, "value"))
        .unwrap_or(DEFAULT_BASE_URL)
        .to_string();

    Ok(ApiDescription {
        format: SourceFormat::Postman,
        title: info_field(root, "name", "API Tests"),
        version: info_field(root, "version", "1.0.0"),
        description: info_field(root, "description", ""),
        base_url,
        auth: AuthInfo {
            schemes: if requires_auth { vec![auth_kind.clone()] } else { Vec::new() },
            kind: auth_kind,
        },
        endpoints,
        models: BTreeMap::new(),
        enhancements: None,
    })
}

/// Folders nest arbitrarily; the innermost folder name becomes the tag.
fn collect_postman_items(items: &[Value], requires_auth: bool, folders: &mut Vec<String>, out: &mut Vec<Endpoint>) {
    for item in items {
        if let Some(children) = item.get("item").and_then(Value::as_array) {
            folders.push(str_at(item, "name").unwrap_or("default").to_string());
            collect_postman_items(children, requires_auth, folders, out);
            folders.pop();
        } else if let Some(request) = item.get("request") {
            out.push(postman_endpoint(item, request, requires_auth, folders.last()));
        }
    }
}

fn postman_endpoint(item: &Value, request: &Value, collection_auth: bool, folder: Option<&String>) -> Endpoint {
    let method = str_at(request, "method").unwrap_or("GET").to_ascii_uppercase();
    let url = request.get("url");
    let path = match url {
        Some(Value::String(raw)) => path_from_raw(raw),
        Some(url) => match url.get("path").and_then(Value::as_array) {
            Some(segments) => {
                let joined: Vec<&str> = segments.iter().filter_map(Value::as_str).collect();
                format!("/{}", joined.join("/"))
            }
            None => path_from_raw(str_at(url, "raw").unwrap_or("/")),
        },
        None => "/".to_string(),
    };
    let parameters = url
        .and_then(|u| u.get("query"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|q| {
            Some(Parameter {
                name: str_at(q, "key")?.to_string(),
                location: "query".to_string(),
                required: !q.get("disabled").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect();
    let requires_auth = match request.get("auth").and_then(|a| str_at(a, "type")) {
        Some("noauth") => false,
        Some(_) => true,
        None => collection_auth,
    };
    let name = str_at(item, "name").unwrap_or_default();
    let operation_id = if name.is_empty() {
        identifier(&format!("{} {}", method, path))
    } else {
        identifier(name)
    };

    let mut endpoint = Endpoint {
        success_status: success_status(&method, &[]),
        scenarios: Vec::new(),
        method,
        path,
        operation_id,
        summary: name.to_string(),
        tags: folder.cloned().into_iter().collect(),
        parameters,
        requires_auth,
    };
    let has_body = request.get("body").is_some();
    endpoint.scenarios = derive_scenarios(&endpoint, has_body);
    endpoint
}

/// Strip scheme, host and `{{variable}}` prefixes from a raw Postman URL.
fn path_from_raw(raw: &str) -> String {
    let without_query = raw.split('?').next().unwrap_or(raw);
    let rest = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let rest = if rest.starts_with("{{") {
        rest.split_once("}}").map(|(_, r)| r).unwrap_or(rest)
    } else if !rest.starts_with('/') {
        rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
    } else {
        rest
    };
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

fn parse_generic(root: &Map<String, Value>) -> Result<ApiDescription, ProviderError> {
    let auth = root
        .get("auth")
        .map(|a| match a {
            Value::String(kind) => normalize_auth(kind, ""),
            other => normalize_auth(str_at(other, "type").unwrap_or("none"), str_at(other, "scheme").unwrap_or("")),
        })
        .unwrap_or_else(|| "none".to_string());

    let mut endpoints = Vec::new();
    for (index, raw) in root
        .get("endpoints")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let Some(path) = str_at(raw, "path") else {
            return Err(ProviderError::InvalidInput(format!(
                "endpoint #{} has no path",
                index + 1
            )));
        };
        let method = str_at(raw, "method").unwrap_or("GET").to_ascii_uppercase();
        let parameters = raw
            .get("parameters")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|p| match p {
                Value::String(name) => Some(Parameter {
                    name: name.clone(),
                    location: "query".to_string(),
                    required: false,
                }),
                other => Some(Parameter {
                    name: str_at(other, "name")?.to_string(),
                    location: str_at(other, "in").unwrap_or("query").to_string(),
                    required: other.get("required").and_then(Value::as_bool).unwrap_or(false),
                }),
            })
            .collect();
        let mut endpoint = Endpoint {
            success_status: raw
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or_else(|| success_status(&method, &[])),
            operation_id: str_at(raw, "name")
                .map(identifier)
                .unwrap_or_else(|| identifier(&format!("{} {}", method, path))),
            summary: str_at(raw, "summary").unwrap_or_default().to_string(),
            tags: str_at(raw, "tag").map(str::to_string).into_iter().collect(),
            requires_auth: raw
                .get("auth")
                .and_then(Value::as_bool)
                .unwrap_or(auth != "none"),
            method,
            path: path.to_string(),
            parameters,
            scenarios: Vec::new(),
        };
        endpoint.scenarios = derive_scenarios(&endpoint, raw.get("body").is_some());
        endpoints.push(endpoint);
    }

    Ok(ApiDescription {
        format: SourceFormat::GenericYaml,
        title: str_at_map(root, "title").unwrap_or("API Tests").to_string(),
        version: root
            .get("version")
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_else(|| "1.0.0".to_string()),
        description: str_at_map(root, "description").unwrap_or_default().to_string(),
        base_url: str_at_map(root, "base_url").unwrap_or(DEFAULT_BASE_URL).to_string(),
        auth: AuthInfo {
            schemes: if auth == "none" { Vec::new() } else { vec![auth.clone()] },
            kind: auth,
        },
        endpoints,
        models: BTreeMap::new(),
        enhancements: None,
    })
}

fn str_at_map<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    root.get(key).and_then(Value::as_str)
}

/// First declared 2xx among 200/201/202/204, else by method.
fn success_status(method: &str, declared: &[&str]) -> u16 {
    for code in ["200", "201", "202", "204"] {
        if declared.contains(&code) {
            return code.parse().unwrap_or(200);
        }
    }
    match method {
        "POST" => 201,
        "DELETE" => 204,
        _ => 200,
    }
}

fn derive_scenarios(endpoint: &Endpoint, has_body: bool) -> Vec<Scenario> {
    let base = identifier(&format!("test {} {}", endpoint.method, endpoint.path));
    let mut scenarios = vec![Scenario {
        name: format!("{}_success", base),
        kind: ScenarioKind::Positive,
        description: format!("Successful {} request to {}", endpoint.method, endpoint.path),
        expected_status: Some(endpoint.success_status),
    }];
    if !endpoint.parameters.is_empty() || has_body {
        scenarios.push(Scenario {
            name: format!("{}_invalid_params", base),
            kind: ScenarioKind::Negative,
            description: format!("Invalid parameters for {} {}", endpoint.method, endpoint.path),
            expected_status: Some(400),
        });
    }
    if endpoint.requires_auth {
        scenarios.push(Scenario {
            name: format!("{}_unauthorized", base),
            kind: ScenarioKind::Negative,
            description: format!("Unauthorized access to {} {}", endpoint.method, endpoint.path),
            expected_status: Some(401),
        });
    }
    scenarios
}

/// Lower snake-case identifier safe for every target language.
pub fn identifier(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("n_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Suggested extra scenarios returned by the reasoning command.
#[derive(Debug, Deserialize)]
struct Enhancement {
    #[serde(default)]
    enhanced_scenarios: BTreeMap<String, Vec<EnhancedScenario>>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EnhancedScenario {
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    expected_status: Option<u16>,
}

fn enhancement_prompt(api: &ApiDescription, language: &str) -> String {
    let endpoints: Vec<String> = api
        .endpoints
        .iter()
        .map(|e| format!("- {} {} ({})", e.method, e.path, e.summary))
        .collect();
    format!(
        "Analyze this API for {language} test generation.\n\
         Title: {title}\nBase URL: {base}\nAuth: {auth}\nEndpoints:\n{endpoints}\n\n\
         Suggest edge-case, boundary and security test scenarios. Respond with JSON only:\n\
         {{\"enhanced_scenarios\": {{\"<path>\": [{{\"name\": \"...\", \"type\": \"positive|negative\", \
         \"description\": \"...\", \"expected_status\": 400}}]}}, \
         \"test_data_strategies\": {{}}, \"test_dependencies\": []}}",
        language = language,
        title = api.title,
        base = api.base_url,
        auth = api.auth.kind,
        endpoints = endpoints.join("\n"),
    )
}

/// Merge reasoning output into `api`. Unparseable output is ignored.
fn apply_enhancement(api: &mut ApiDescription, raw: &str) -> bool {
    let body = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let Ok(enhancement) = serde_json::from_str::<Enhancement>(body) else {
        return false;
    };
    for endpoint in &mut api.endpoints {
        let Some(extra) = enhancement.enhanced_scenarios.get(&endpoint.path) else {
            continue;
        };
        for scenario in extra {
            if endpoint.scenarios.iter().any(|s| s.name == scenario.name) {
                continue;
            }
            endpoint.scenarios.push(Scenario {
                name: identifier(&scenario.name),
                kind: match scenario.kind.as_deref() {
                    Some("positive") => ScenarioKind::Positive,
                    _ => ScenarioKind::Negative,
                },
                description: scenario.description.clone(),
                expected_status: scenario.expected_status,
            });
        }
    }
    if !enhancement.rest.is_empty() {
        api.enhancements = Some(Value::Object(enhancement.rest));
    }
    true
}

/// Provider for [`Capability::Parse`].
pub struct ParserProvider {
    reasoning: Option<ReasoningClient>,
}

impl ParserProvider {
    pub fn new() -> Self {
        Self { reasoning: None }
    }

    pub fn with_reasoning(mut self, client: ReasoningClient) -> Self {
        self.reasoning = Some(client);
        self
    }

    async fn enhance(&self, client: &ReasoningClient, api: &mut ApiDescription, input: &AgentInput) -> Result<(), ProviderError> {
        let prompt = enhancement_prompt(api, &input.config.language.to_string());
        let cwd = input
            .config
            .spec_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        match client.execute(&prompt, cwd).await {
            Ok(response) => {
                if !apply_enhancement(api, &response.output) {
                    warn!(project = %input.project_id, "reasoning output was not usable JSON, keeping plain parse");
                }
                Ok(())
            }
            Err(err) => match classify(err.clone()) {
                AgentOutcome::Retryable(_) => Err(err),
                _ => {
                    warn!(project = %input.project_id, error = %err, "reasoning enhancement failed, keeping plain parse");
                    Ok(())
                }
            },
        }
    }
}

impl Default for ParserProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityProvider for ParserProvider {
    fn capability(&self) -> Capability {
        Capability::Parse
    }

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput, ProviderError> {
        let path = &input.config.spec_path;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut api = parse_document(path, &text)?;
        debug!(
            project = %input.project_id,
            format = ?api.format,
            endpoints = api.endpoints.len(),
            "parsed API description"
        );

        if let Some(client) = &self.reasoning {
            self.enhance(client, &mut api, input).await?;
        }

        info!(
            project = %input.project_id,
            title = %api.title,
            endpoints = api.endpoints.len(),
            scenarios = api.scenario_count(),
            "API description parsed"
        );
        let payload = serde_json::to_value(&api).map_err(|e| ProviderError::Other(e.to_string()))?;
        Ok(AgentOutput::new(payload))
    }
}
