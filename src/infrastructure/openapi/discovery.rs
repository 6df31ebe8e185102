use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::document::Document;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const HTML_BODY_LIMIT: usize = 512 * 1024;

/// Well-known spec locations, ordered by how common the hosting convention
/// is. Probe results are ranked by this index, not by response latency.
pub const PROBE_PATHS: &[&str] = &[
    // OpenAPI 3.x standard
    "/openapi.json",
    "/openapi.yaml",
    "/openapi.yml",
    "/.well-known/openapi",
    "/.well-known/openapi.json",
    "/.well-known/openapi.yaml",
    // Swagger 2.x / SpringFox / SpringDoc
    "/swagger.json",
    "/swagger.yaml",
    "/swagger/doc.json",
    "/v3/api-docs",
    "/v3/api-docs.yaml",
    "/v2/api-docs",
    "/v2/api-docs.yaml",
    // Generic
    "/api-docs",
    "/api-docs.json",
    "/api-docs.yaml",
    "/docs/openapi.json",
    "/docs/openapi.yaml",
    "/docs/swagger.json",
    "/api/swagger.json",
    "/api/openapi.json",
    "/api/openapi.yaml",
    "/api/docs",
    "/api/schema",
    // FastAPI / Python
    "/openapi",
    "/docs/openapi",
    // .NET / NSwag
    "/swagger/v1/swagger.json",
    "/swagger/v2/swagger.json",
    // Rails / Rswag
    "/api-docs/v1/swagger.json",
    "/api-docs/v1/swagger.yaml",
    // Express / NestJS
    "/api/api-docs",
    "/api/v1/api-docs",
    // Versioned prefixes
    "/api/v1/openapi.json",
    "/api/v2/openapi.json",
    "/api/v1/swagger.json",
    "/api/v2/swagger.json",
];

/// Documentation-UI pages that may embed a spec URL in their markup.
const HTML_PROBE_PATHS: &[&str] = &[
    "/swagger-ui.html",
    "/swagger-ui/index.html",
    "/swagger",
    "/docs",
    "/api/docs",
    "/redoc",
    "/api-docs/swagger-config",
];

static SPEC_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:url\s*[:=]\s*["']|spec[Uu]rl\s*[:=]\s*["']|configUrl\s*[:=]\s*["'])(https?://[^"'\s]+|/[^"'\s]+)"#,
    )
    .expect("spec url regex")
});

static LINK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]+)>;\s*rel="(?:service-desc|describedby)""#).expect("link header regex")
});

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch spec from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("spec at {origin} returned HTTP {status}")]
    Status { origin: String, status: u16 },
    #[error("failed to parse spec from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document at {origin} is not an OpenAPI 3.x spec")]
    NotOpenApi { origin: String },
    #[error(
        "no OpenAPI spec found at {base_url} (tried {paths} paths + {pages} HTML pages)"
    )]
    NotFound {
        base_url: String,
        paths: usize,
        pages: usize,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Parses raw bytes as JSON first, then YAML, and insists on an `openapi`
/// version marker so arbitrary JSON endpoints are not mistaken for specs.
pub fn parse_document(origin: &str, raw: &[u8]) -> Result<Document, SpecError> {
    let doc: Document = match serde_json::from_slice(raw) {
        Ok(doc) => doc,
        Err(_) => serde_yaml::from_slice(raw).map_err(|source| SpecError::Parse {
            origin: origin.to_string(),
            source,
        })?,
    };
    if doc.openapi.is_empty() {
        return Err(SpecError::NotOpenApi {
            origin: origin.to_string(),
        });
    }
    Ok(doc)
}

fn probe_client() -> Result<reqwest::Client, SpecError> {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(SpecError::Client)
}

/// Loads an OpenAPI document from a local file path or an http(s) URL.
pub async fn load_spec(source: &str) -> Result<Document, SpecError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = probe_client()?;
        return fetch_spec(&client, source).await;
    }

    let raw = std::fs::read(Path::new(source)).map_err(|err| SpecError::Io {
        path: source.to_string(),
        source: err,
    })?;
    parse_document(source, &raw)
}

async fn fetch_spec(client: &reqwest::Client, url: &str) -> Result<Document, SpecError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| SpecError::Fetch {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SpecError::Status {
            origin: url.to_string(),
            status: status.as_u16(),
        });
    }
    if content_type_is_html(&response) {
        return Err(SpecError::NotOpenApi {
            origin: url.to_string(),
        });
    }

    let raw = response.bytes().await.map_err(|source| SpecError::Fetch {
        url: url.to_string(),
        source,
    })?;
    parse_document(url, &raw)
}

fn content_type_is_html(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/html"))
        .unwrap_or(false)
}

/// Probes a base URL for an OpenAPI document and returns it together with
/// the URL it was found at.
///
/// Three phases run in order; the first that yields a parseable non-HTML
/// document wins:
/// 1. `Link` headers on the base URL (`rel="service-desc"|"describedby"`),
/// 2. a concurrent sweep of [`PROBE_PATHS`] where the lowest list index wins,
/// 3. scraping documentation-UI pages for embedded spec URLs.
pub async fn discover_spec(base_url: &str) -> Result<(Document, String), SpecError> {
    let base_url = base_url.trim_end_matches('/');
    let client = probe_client()?;

    if let Some(found) = check_link_header(&client, base_url).await {
        return Ok(found);
    }

    if let Some(found) = concurrent_probe(&client, base_url).await {
        return Ok(found);
    }

    if let Some(found) = discover_from_html(&client, base_url).await {
        return Ok(found);
    }

    Err(SpecError::NotFound {
        base_url: base_url.to_string(),
        paths: PROBE_PATHS.len(),
        pages: HTML_PROBE_PATHS.len(),
    })
}

async fn check_link_header(
    client: &reqwest::Client,
    base_url: &str,
) -> Option<(Document, String)> {
    let response = client.head(base_url).send().await.ok()?;

    for link in response.headers().get_all(reqwest::header::LINK) {
        let Ok(link) = link.to_str() else { continue };
        let Some(captures) = LINK_HEADER_RE.captures(link) else {
            continue;
        };
        let spec_url = resolve_url(base_url, &captures[1]);
        if let Ok(doc) = fetch_spec(client, &spec_url).await {
            debug!(%spec_url, "spec found via Link header");
            return Some((doc, spec_url));
        }
    }
    None
}

async fn concurrent_probe(
    client: &reqwest::Client,
    base_url: &str,
) -> Option<(Document, String)> {
    let attempts = PROBE_PATHS.iter().enumerate().map(|(idx, path)| {
        let spec_url = format!("{base_url}{path}");
        let client = client.clone();
        async move {
            match fetch_spec(&client, &spec_url).await {
                Ok(doc) => Some((idx, doc, spec_url)),
                Err(_) => None,
            }
        }
    });

    // All probes finish before selection so a fast late-ranked path can
    // never beat a slower earlier-ranked one.
    let results = futures::future::join_all(attempts).await;
    results
        .into_iter()
        .flatten()
        .min_by_key(|(idx, _, _)| *idx)
        .map(|(idx, doc, spec_url)| {
            debug!(%spec_url, rank = idx, "spec found via path probe");
            (doc, spec_url)
        })
}

async fn discover_from_html(
    client: &reqwest::Client,
    base_url: &str,
) -> Option<(Document, String)> {
    for path in HTML_PROBE_PATHS {
        let page_url = format!("{base_url}{path}");
        let Ok(response) = client.get(&page_url).send().await else {
            continue;
        };
        if !response.status().is_success() || !content_type_is_html(&response) {
            continue;
        }

        let Ok(body) = response.bytes().await else {
            continue;
        };
        let body = &body[..body.len().min(HTML_BODY_LIMIT)];
        let text = String::from_utf8_lossy(body);

        for captures in SPEC_URL_RE.captures_iter(&text) {
            let spec_url = resolve_url(base_url, &captures[1]);
            if let Ok(doc) = fetch_spec(client, &spec_url).await {
                debug!(%spec_url, page = %page_url, "spec found via HTML scrape");
                return Some((doc, spec_url));
            }
        }
    }
    None
}

fn resolve_url(base_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        reference.trim_start_matches('/')
    )
}
