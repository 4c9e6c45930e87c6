use crate::config::ClientConfig;
use crate::query::{FeedWindow, QuerySpec};
use crate::resources::ConfigResource;
use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderValue, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Method, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub const CLIENT_USER_AGENT: &str = "Signal Sciences Client API (Rust)";

const LOGIN_OK: &str = "/";
const LOGIN_INVALID: &str = "/login?p=invalid";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Login failed! Check SIGSCI_EMAIL and SIGSCI_PASSWORD")]
    InvalidCredentials,
    #[error("unexpected login response, Location: {0}")]
    UnexpectedRedirect(String),
    #[error("login succeeded but no session cookie was set")]
    MissingSession,
    /// The response body carried a `message` field.
    #[error("{message}")]
    Api { message: String },
    #[error("{message}\nData: {entry}")]
    BatchEntry { message: String, entry: String },
    #[error("malformed list file: {0}")]
    MalformedBatch(String),
}

/// Cookie header captured from a successful login. It has no expiry
/// tracking; a stale session surfaces as an ordinary API error.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    cookie: String,
}

impl Session {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("cookie", &"*****").finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub body: String,
    pub json: Option<Value>,
}

impl ResponseData {
    /// Parses the body and fails if it carries a `message` field, whatever
    /// the HTTP status.
    pub fn into_checked_json(self) -> Result<Value> {
        let json = match self.json {
            Some(json) => json,
            None => serde_json::from_str(&self.body).with_context(|| {
                format!("parsing response body as JSON (HTTP {})", self.status)
            })?,
        };
        check_message(&json)?;
        Ok(json)
    }
}

pub fn check_message(json: &Value) -> Result<(), ApiError> {
    match json.get("message") {
        Some(Value::String(message)) => Err(ApiError::Api {
            message: message.clone(),
        }),
        Some(other) => Err(ApiError::Api {
            message: other.to_string(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct DashboardClient {
    http: Client,
    host: Url,
    api_root: Url,
    site_root: Url,
}

impl DashboardClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let host = Url::parse(&config.base_url).context("parsing base URL")?;
        let api_root = host
            .join(&format!("api/{}/", config.api_version))
            .context("building API root URL")?;
        let site_root = api_root
            .join(&format!("corps/{}/sites/{}/", config.corp, config.site))
            .context("building site URL")?;
        let http = Client::builder()
            .redirect(Policy::none())
            .user_agent(HeaderValue::from_static(CLIENT_USER_AGENT))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            host,
            api_root,
            site_root,
        })
    }

    /// Posts the login form without following the redirect and decides the
    /// outcome from the `Location` header alone.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        let url = self.api_root.join("auth/login").context("building login URL")?;
        debug!(%url, "authenticating");

        let response = self
            .http
            .post(url)
            .form(&[("email", email), ("password", password)])
            .send()
            .context("sending login request")?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        match location.as_str() {
            LOGIN_OK => {
                let cookie = response
                    .headers()
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .filter_map(|c| c.split(';').next())
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ");
                if cookie.is_empty() {
                    return Err(ApiError::MissingSession.into());
                }
                info!("authenticated");
                Ok(Session::new(cookie))
            }
            LOGIN_INVALID => Err(ApiError::InvalidCredentials.into()),
            other => Err(ApiError::UnexpectedRedirect(other.to_string()).into()),
        }
    }

    pub fn logout(&self, session: &Session) -> Result<()> {
        let url = self.api_root.join("auth/logout").context("building logout URL")?;
        self.send(self.request(session, Method::GET, &url), &url)?;
        Ok(())
    }

    pub fn search(&self, session: &Session, query: &QuerySpec) -> Result<Value> {
        let url = with_query(self.site_url("requests")?, &query.params());
        self.get_json(session, url)
    }

    pub fn agents(&self, session: &Session) -> Result<Value> {
        self.get_json(session, self.site_url("agents")?)
    }

    pub fn list(&self, session: &Session, resource: ConfigResource) -> Result<Value> {
        self.get_json(session, self.site_url(resource.endpoint())?)
    }

    /// Walks the feed one page at a time, handing each page's `data` to
    /// `on_page` before requesting the next. Returns the number of pages.
    pub fn feed<F>(&self, session: &Session, window: &FeedWindow, mut on_page: F) -> Result<usize>
    where
        F: FnMut(&Value) -> Result<()>,
    {
        let mut url = with_query(self.site_url("feed/requests")?, &window.params());
        let mut pages = 0;

        loop {
            let page = self.get_json(session, url.clone())?;
            pages += 1;

            let data = page
                .get("data")
                .with_context(|| format!("feed page {pages} has no `data` field (query: {url})"))?;
            on_page(data)?;

            let next = page
                .get("next")
                .and_then(|n| n.get("uri"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if next.is_empty() {
                break;
            }
            url = self.cursor_url(next);
            debug!(page = pages, %url, "following feed cursor");
        }

        Ok(pages)
    }

    pub fn post_entry(&self, session: &Session, endpoint: &str, body: &Value) -> Result<Value> {
        let url = self.site_url(endpoint)?;
        let request = self.request(session, Method::POST, &url).json(body);
        self.send(request, &url)?
            .into_checked_json()
            .with_context(|| format!("query: {url}"))
    }

    /// Issues a DELETE for `<endpoint>/<id>`. An empty or non-JSON body
    /// counts as success.
    pub fn delete_entry(&self, session: &Session, endpoint: &str, id: &str) -> Result<()> {
        let mut url = self.site_url(endpoint)?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("site URL cannot carry an entry id"))?
            .push(id);
        let response = self.send(self.request(session, Method::DELETE, &url), &url)?;
        if let Some(json) = &response.json {
            check_message(json).with_context(|| format!("query: {url}"))?;
        }
        Ok(())
    }

    fn get_json(&self, session: &Session, url: Url) -> Result<Value> {
        self.send(self.request(session, Method::GET, &url), &url)?
            .into_checked_json()
            .with_context(|| format!("query: {url}"))
    }

    fn request(&self, session: &Session, method: Method, url: &Url) -> RequestBuilder {
        self.http
            .request(method, url.clone())
            .header(COOKIE, session.cookie())
            .header(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    fn send(&self, request: RequestBuilder, url: &Url) -> Result<ResponseData> {
        debug!(%url, "sending request");
        let response = request
            .send()
            .with_context(|| format!("query: {url}"))?;

        let status = response.status().as_u16();
        let body = response.text().context("reading response body")?;
        let json = serde_json::from_str(&body).ok();

        Ok(ResponseData { status, body, json })
    }

    /// The cursor only ever supplies path and query; the host stays the
    /// dashboard's.
    fn cursor_url(&self, cursor: &str) -> Url {
        let cursor = cursor.split_once('#').map_or(cursor, |(rest, _)| rest);
        let (path, query) = match cursor.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (cursor, None),
        };
        let mut url = self.host.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    fn site_url(&self, resource: &str) -> Result<Url> {
        self.site_root
            .join(resource)
            .with_context(|| format!("joining `{resource}` to site URL"))
    }
}

fn with_query(mut url: Url, params: &[(&str, String)]) -> Url {
    if !params.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_API_VERSION, SortOrder};
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> DashboardClient {
        DashboardClient::new(&ClientConfig {
            email: "me@example.com".into(),
            password: "secret".into(),
            corp: "acme".into(),
            site: "www".into(),
            base_url: server.base_url(),
            api_version: DEFAULT_API_VERSION.into(),
        })
        .unwrap()
    }

    #[test]
    fn login_redirect_to_root_yields_session() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v0/auth/login")
                .x_www_form_urlencoded_tuple("email", "me@example.com")
                .x_www_form_urlencoded_tuple("password", "secret");
            then.status(302)
                .header("Location", "/")
                .header("Set-Cookie", "session=abc123; Path=/; HttpOnly");
        });
        let landing = server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("<html></html>");
        });

        let session = client_for(&server)
            .authenticate("me@example.com", "secret")
            .unwrap();

        login.assert();
        landing.assert_hits(0);
        assert_eq!(session.cookie(), "session=abc123");
    }

    #[test]
    fn login_redirect_to_invalid_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v0/auth/login");
            then.status(302).header("Location", "/login?p=invalid");
        });

        let err = client_for(&server)
            .authenticate("me@example.com", "wrong")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::InvalidCredentials)
        ));
    }

    #[test]
    fn login_with_other_location_reports_header() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v0/auth/login");
            then.status(302).header("Location", "/login?p=mfa");
        });

        let err = client_for(&server)
            .authenticate("me@example.com", "secret")
            .unwrap_err();
        assert!(err.to_string().contains("/login?p=mfa"));
    }

    #[test]
    fn search_sends_session_query_and_headers() {
        let server = MockServer::start();
        let search = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/requests")
                .query_param("q", "from:-6h sort:time-desc tag:SQLI tag:XSS")
                .query_param("limit", "25")
                .header("Cookie", "session=abc123")
                .header("User-Agent", CLIENT_USER_AGENT)
                .header("Content-Type", "application/json");
            then.status(200)
                .json_body(json!({"totalCount": 0, "next": {"uri": ""}, "data": []}));
        });

        let query = QuerySpec {
            from_time: Some("-6h".into()),
            sort: Some(SortOrder::Desc),
            tags: Some(vec!["SQLI".into(), "XSS".into()]),
            limit: 25,
            ..Default::default()
        };
        let value = client_for(&server)
            .search(&Session::new("session=abc123"), &query)
            .unwrap();

        search.assert();
        assert_eq!(value["totalCount"], 0);
    }

    #[test]
    fn message_field_fails_regardless_of_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v0/corps/acme/sites/www/agents");
            then.status(200)
                .json_body(json!({"message": "Site not found", "data": [{"agent": 1}]}));
        });

        let err = client_for(&server)
            .agents(&Session::new("session=abc"))
            .unwrap_err();

        match err.downcast_ref::<ApiError>() {
            Some(ApiError::Api { message }) => assert_eq!(message, "Site not found"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(format!("{err:#}").contains("/api/v0/corps/acme/sites/www/agents"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v0/corps/acme/sites/www/redactions");
            then.status(502).body("<html>bad gateway</html>");
        });

        let err = client_for(&server)
            .list(&Session::new("session=abc"), ConfigResource::Redactions)
            .unwrap_err();
        assert!(format!("{err:#}").contains("parsing response body"));
    }

    #[test]
    fn lists_configuration_resource() {
        let server = MockServer::start();
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/pathwhitelist")
                .header("Cookie", "session=abc");
            then.status(200)
                .json_body(json!({"data": [{"id": "p1", "path": "/health"}]}));
        });

        let value = client_for(&server)
            .list(&Session::new("session=abc"), ConfigResource::PathWhitelist)
            .unwrap();

        list.assert();
        assert_eq!(value["data"][0]["path"], "/health");
    }

    #[test]
    fn feed_follows_next_links_in_order() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/requests")
                .query_param("from", "1000")
                .query_param("until", "2000")
                .query_param("tags", "SQLI,bad-bot");
            then.status(200).json_body(json!({
                "data": [{"id": "r1"}],
                "next": {"uri": "/api/v0/corps/acme/sites/www/feed/page-2?next=c2"}
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/page-2")
                .query_param("next", "c2");
            then.status(200).json_body(json!({
                "data": [{"id": "r2"}],
                "next": {"uri": "/api/v0/corps/acme/sites/www/feed/page-3?next=c3"}
            }));
        });
        let third = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/page-3")
                .query_param("next", "c3");
            then.status(200)
                .json_body(json!({"data": [{"id": "r3"}], "next": {"uri": ""}}));
        });

        let window = FeedWindow {
            from: "1000".into(),
            until: "2000".into(),
            tags: vec!["SQLI".into(), "bad-bot".into()],
        };
        let mut seen = Vec::new();
        let pages = client_for(&server)
            .feed(&Session::new("session=abc"), &window, |data| {
                seen.push(data[0]["id"].as_str().unwrap_or_default().to_string());
                Ok(())
            })
            .unwrap();

        first.assert_hits(1);
        second.assert_hits(1);
        third.assert_hits(1);
        assert_eq!(pages, 3);
        assert_eq!(seen, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn feed_stops_on_message_mid_stream() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/requests");
            then.status(200).json_body(json!({
                "data": [{"id": "r1"}],
                "next": {"uri": "/api/v0/corps/acme/sites/www/feed/page-2"}
            }));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/page-2");
            then.status(400).json_body(json!({"message": "cursor expired"}));
        });

        let window = FeedWindow {
            from: "1".into(),
            until: "2".into(),
            tags: vec![],
        };
        let mut pages_seen = 0;
        let err = client_for(&server)
            .feed(&Session::new("s=1"), &window, |_| {
                pages_seen += 1;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(pages_seen, 1);
        assert!(format!("{err:#}").contains("cursor expired"));
    }

    #[test]
    fn delete_accepts_empty_body() {
        let server = MockServer::start();
        let delete = server.mock(|when, then| {
            when.method(DELETE)
                .path("/api/v0/corps/acme/sites/www/blacklist/b1");
            then.status(204);
        });

        client_for(&server)
            .delete_entry(&Session::new("s=1"), "blacklist", "b1")
            .unwrap();
        delete.assert();
    }

    #[test]
    fn delete_id_stays_one_path_segment() {
        let server = MockServer::start();
        let escaped = server.mock(|when, then| {
            when.method(DELETE)
                .path_contains("/api/v0/corps/acme/sites/www/redactions/");
            then.status(204);
        });
        let agents = server.mock(|when, then| {
            when.method(DELETE).path("/api/v0/corps/acme/sites/www/agents");
            then.status(204);
        });

        client_for(&server)
            .delete_entry(&Session::new("s=1"), "redactions", "../agents?x=1#y")
            .unwrap();

        escaped.assert_hits(1);
        agents.assert_hits(0);
    }

    #[test]
    fn login_without_cookie_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v0/auth/login");
            then.status(302).header("Location", "/");
        });

        let err = client_for(&server)
            .authenticate("me@example.com", "secret")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::MissingSession)
        ));
    }

    #[test]
    fn feed_cursor_cannot_leave_dashboard_host() {
        let server = MockServer::start();
        let foreign = MockServer::start();
        let cursor = format!("//{}/steal?next=c2", foreign.address());
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v0/corps/acme/sites/www/feed/requests");
            then.status(200)
                .json_body(json!({"data": [], "next": {"uri": cursor}}));
        });
        let stolen = foreign.mock(|when, then| {
            when.path_contains("steal");
            then.status(200)
                .json_body(json!({"data": [], "next": {"uri": ""}}));
        });

        let window = FeedWindow {
            from: "1".into(),
            until: "2".into(),
            tags: vec![],
        };
        let _ = client_for(&server).feed(&Session::new("session=secret"), &window, |_| Ok(()));
        stolen.assert_hits(0);

        let client = client_for(&server);
        for cursor in [
            format!("//{}/steal", foreign.address()),
            format!("{}/steal", foreign.base_url()),
        ] {
            let url = client.cursor_url(&cursor);
            assert_eq!(url.host_str(), client.host.host_str());
            assert_eq!(url.port(), client.host.port());
        }
        assert_eq!(
            client.cursor_url("/api/v0/feed/page-2?next=c2#frag").as_str(),
            format!("{}/api/v0/feed/page-2?next=c2", server.base_url())
        );
    }

    #[test]
    fn session_debug_hides_cookie() {
        let session = Session::new("session=secret");
        assert!(!format!("{session:?}").contains("secret"));
    }
}
