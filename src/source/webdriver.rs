//! Live list view behind a W3C WebDriver session.
//!
//! Every sample runs one probe script in the page and returns a plain JSON
//! snapshot (headers, countable rows, pager controls), so rows never hold
//! element references and a re-render cannot invalidate them.

use crate::source::lookup::{resolve_column, HeaderCell};
use crate::source::{DataSource, RowKeys, SourceError};
use crate::traversal::signature::ID_ATTRIBUTES;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// WebDriver error codes that mean "try again on the next poll".
const TRANSIENT_ERRORS: [&str; 3] = ["stale element reference", "no such element", "javascript error"];

/// Control checks shared by the probe and the click, so both pick the same
/// element.
macro_rules! control_helpers {
    () => {
        r#"
const analyze = (btn) => {
  const cs = getComputedStyle(btn);
  const hidden = btn.offsetParent === null || cs.display === 'none' || cs.visibility === 'hidden' || parseFloat(cs.opacity || '1') === 0;
  const attr = btn.hasAttribute('disabled') || (btn.getAttribute('aria-disabled') || '').toLowerCase() === 'true' || /disabled/i.test(btn.className);
  const pointer = cs.pointerEvents === 'none';
  const tab = btn.getAttribute('tabindex') === '-1';
  const reason = hidden ? 'hidden' : attr ? 'aria/attr disabled' : pointer ? 'pointer-events none' : tab ? 'tabindex -1' : 'ok';
  return { present: true, disabled: reason !== 'ok', reason };
};
const usable = (selector) => [...document.querySelectorAll(selector)].find((b) => !analyze(b).disabled);
"#
    };
}

const PROBE_SCRIPT: &str = concat!(
    control_helpers!(),
    r#"
const sel = arguments[0];
const visible = (el) => {
  if (el.offsetParent !== null) return true;
  const cs = getComputedStyle(el);
  return !(cs.display === 'none' || cs.visibility === 'hidden' || parseFloat(cs.opacity || '1') === 0);
};
const text = (cell) => {
  const lt = cell.querySelector('[lt-prop-value]');
  if (lt) {
    const v = (lt.getAttribute('lt-prop-value') || '').trim();
    if (v) return v;
  }
  const t = (cell.innerText || cell.textContent || '').trim();
  if (t) return t;
  const titled = cell.getAttribute('title') || cell.querySelector('[title]')?.getAttribute('title') || '';
  return titled.trim();
};
const control = (selector) => {
  const found = [...document.querySelectorAll(selector)];
  if (!found.length) return { present: false, disabled: true, reason: 'not found' };
  for (const btn of found) {
    const info = analyze(btn);
    if (!info.disabled) return info;
  }
  const first = analyze(found[0]);
  return { ...first, reason: `all candidates disabled (${first.reason})` };
};
const column = (el, fallback) => {
  const n = parseInt(el.getAttribute(sel.column_attribute), 10);
  return Number.isNaN(n) ? fallback : n;
};
let rows = [];
for (const s of sel.rows) {
  rows = [...document.querySelectorAll(s)];
  if (rows.length) break;
}
const headers = [...document.querySelectorAll(sel.header)].map((h) => ({
  label: (h.innerText || h.textContent || '').trim(),
  attribute: h.getAttribute(sel.header_attribute),
  column: column(h, null),
}));
const out = [];
for (const row of rows) {
  if (row.getAttribute('aria-hidden') === 'true') continue;
  const cells = [...row.querySelectorAll(sel.cell)];
  if (!cells.length || !visible(row)) continue;
  const values = [];
  cells.forEach((c, i) => { values[column(c, i)] = text(c); });
  out.push({
    attributes: sel.id_attributes.filter((a) => row.getAttribute(a)).map((a) => [a, row.getAttribute(a)]),
    link: row.querySelector(sel.link)?.getAttribute('href') || null,
    cells: Array.from(values, (v) => v ?? ''),
  });
}
const pager = document.querySelector(sel.pager_active);
return {
  headers,
  rows: out,
  pager_active: pager ? (pager.innerText || pager.textContent || '').trim() : null,
  next: control(sel.next),
  first: control(sel.first),
};
"#
);

const CLICK_SCRIPT: &str = concat!(
    control_helpers!(),
    r#"
const target = usable(arguments[0]);
if (!target) return false;
target.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true, view: window }));
return true;
"#
);

/// CSS selectors the probe uses against the list view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    /// Row selectors tried in order; the first one matching anything wins
    pub rows: Vec<String>,
    pub cell: String,
    pub header: String,
    /// Header attribute carrying a stable column id
    pub header_attribute: String,
    /// Header/cell attribute carrying an explicit zero-based column index
    pub column_attribute: String,
    pub link: String,
    pub next: String,
    pub first: String,
    pub pager_active: String,
    pub id_attributes: Vec<String>,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            rows: vec![
                "lyte-exptable-tr".into(),
                "[role=\"row\"]".into(),
                "tbody tr".into(),
            ],
            cell: "lyte-exptable-td, [role=\"cell\"], td".into(),
            header: "lyte-exptable-th".into(),
            header_attribute: "data-zcqa".into(),
            column_attribute: "cxcellcol".into(),
            link: "a[href*=\"/crm/\"]".into(),
            next: "div.lyteSingleFront.lyteIconSingleFront[role=\"button\"][aria-label=\"next\" i]".into(),
            first: "div[role=\"button\"][aria-label=\"first\"]".into(),
            pager_active: "[data-zcqa=\"pager\"] .active, lyte-pagination .active, .lytePagination .active".into(),
            id_attributes: ID_ATTRIBUTES.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// How `force_first_page` rewrites a list URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstPagePolicy {
    /// Path segment marking a list view
    pub list_segment: String,
    pub page_param: String,
    pub page_value: String,
    pub per_page_param: String,
    pub per_page_value: String,
}

impl Default for FirstPagePolicy {
    fn default() -> Self {
        Self {
            list_segment: "list".into(),
            page_param: "page".into(),
            page_value: "1".into(),
            per_page_param: "per_page".into(),
            per_page_value: "10".into(),
        }
    }
}

/// Rewritten first-page URL, or `None` if `current` is not a list URL or
/// already points at the first page.
pub fn first_page_url(current: &str, policy: &FirstPagePolicy) -> Option<String> {
    let mut url = Url::parse(current).ok()?;
    let is_list = url
        .path_segments()
        .map_or(false, |mut segments| segments.any(|s| s == policy.list_segment));
    if !is_list {
        return None;
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let mut changed = false;
    for (key, value) in [
        (&policy.page_param, &policy.page_value),
        (&policy.per_page_param, &policy.per_page_value),
    ] {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) if v == value => {}
            Some((_, v)) => {
                *v = value.clone();
                changed = true;
            }
            None => {
                pairs.push((key.clone(), value.clone()));
                changed = true;
            }
        }
    }
    if !changed {
        return None;
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
    Some(url.into())
}

/// `page` query parameter of a location, if numeric.
pub fn page_number_from_url(location: &str, param: &str) -> Option<u32> {
    let url = Url::parse(location).ok()?;
    let raw = url.query_pairs().find(|(k, _)| k == param)?.1.into_owned();
    raw.trim().parse().ok()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

fn classify(err: WireError) -> SourceError {
    let detail = format!("{}: {}", err.error, err.message);
    if TRANSIENT_ERRORS.contains(&err.error.as_str()) {
        SourceError::Unavailable(detail)
    } else {
        SourceError::Protocol(detail)
    }
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SourceError> {
    let response = request.send().await?;
    let status = response.status();
    let body: Envelope = response.json().await?;

    if !status.is_success() {
        let err: WireError = serde_json::from_value(body.value)
            .map_err(|e| SourceError::Protocol(format!("HTTP {}: {}", status, e)))?;
        return Err(classify(err));
    }
    serde_json::from_value(body.value).map_err(|e| SourceError::Protocol(e.to_string()))
}

/// Minimal W3C WebDriver client: session, navigation and script execution.
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: Client,
    base_url: String,
    session_id: String,
}

impl WebDriverClient {
    fn http(timeout: Duration) -> Result<Client, SourceError> {
        Ok(Client::builder().timeout(timeout).build()?)
    }

    /// Open a new browser session.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self, SourceError> {
        let http = Self::http(timeout)?;
        let base_url = endpoint.trim_end_matches('/').to_string();
        let body = json!({ "capabilities": { "alwaysMatch": {} } });

        let session: NewSession = send(http.post(format!("{}/session", base_url)).json(&body)).await?;
        info!(session = %session.session_id, "webdriver session opened");
        Ok(Self {
            http,
            base_url,
            session_id: session.session_id,
        })
    }

    /// Reuse an existing session (e.g. a browser the user already logged in with).
    pub fn attach(endpoint: &str, session_id: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            http: Self::http(timeout)?,
            base_url: endpoint.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}/{}", self.base_url, self.session_id, path)
    }

    pub async fn navigate(&self, url: &str) -> Result<(), SourceError> {
        let _: Value = send(self.http.post(self.endpoint("url")).json(&json!({ "url": url }))).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, SourceError> {
        send(self.http.get(self.endpoint("url"))).await
    }

    pub async fn execute<T: DeserializeOwned>(&self, script: &str, args: Vec<Value>) -> Result<T, SourceError> {
        let body = json!({ "script": script, "args": args });
        send(self.http.post(self.endpoint("execute/sync")).json(&body)).await
    }

    pub async fn close(&self) -> Result<(), SourceError> {
        let _: Value = send(self.http.delete(format!("{}/session/{}", self.base_url, self.session_id))).await?;
        info!(session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

/// State of a pager control as seen by the probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlProbe {
    pub present: bool,
    pub disabled: bool,
    pub reason: String,
}

impl ControlProbe {
    pub fn is_usable(&self) -> bool {
        self.present && !self.disabled
    }
}

/// One probe result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableProbe {
    #[serde(default)]
    pub headers: Vec<HeaderCell>,
    #[serde(default)]
    pub rows: Vec<RowKeys>,
    #[serde(default)]
    pub pager_active: Option<String>,
    #[serde(default)]
    pub next: ControlProbe,
    #[serde(default)]
    pub first: ControlProbe,
}

/// [`DataSource`] over a browser page reached through WebDriver.
pub struct WebDriverSource {
    client: WebDriverClient,
    selectors: Selectors,
    first_page: FirstPagePolicy,
}

impl WebDriverSource {
    pub fn new(client: WebDriverClient, selectors: Selectors, first_page: FirstPagePolicy) -> Self {
        Self {
            client,
            selectors,
            first_page,
        }
    }

    pub fn client(&self) -> &WebDriverClient {
        &self.client
    }

    pub async fn probe(&self) -> Result<TableProbe, SourceError> {
        let selectors = serde_json::to_value(&self.selectors)
            .map_err(|e| SourceError::Protocol(e.to_string()))?;
        self.client.execute(PROBE_SCRIPT, vec![selectors]).await
    }

    async fn click(&self, selector: &str) -> Result<bool, SourceError> {
        self.client.execute(CLICK_SCRIPT, vec![json!(selector)]).await
    }
}

#[async_trait]
impl DataSource for WebDriverSource {
    type Row = RowKeys;

    async fn visible_rows(&mut self) -> Result<Vec<RowKeys>, SourceError> {
        Ok(self.probe().await?.rows)
    }

    async fn column_index(&mut self, label: &str) -> Result<usize, SourceError> {
        let probe = self.probe().await?;
        resolve_column(&probe.headers, label).ok_or_else(|| SourceError::ColumnNotFound {
            label: label.to_string(),
        })
    }

    fn read_cell(&self, row: &RowKeys, column: usize) -> String {
        row.cells
            .get(column)
            .map(|c| c.trim().to_string())
            .unwrap_or_default()
    }

    fn row_keys(&self, row: &RowKeys) -> RowKeys {
        row.clone()
    }

    async fn page_identity(&mut self) -> Result<String, SourceError> {
        self.client.current_url().await
    }

    async fn page_number(&mut self) -> Result<Option<u32>, SourceError> {
        let location = self.client.current_url().await?;
        if let Some(n) = page_number_from_url(&location, &self.first_page.page_param) {
            return Ok(Some(n));
        }
        let probe = self.probe().await?;
        Ok(probe.pager_active.and_then(|t| t.trim().parse().ok()))
    }

    async fn is_advance_available(&mut self) -> Result<bool, SourceError> {
        let next = self.probe().await?.next;
        if !next.is_usable() {
            info!(reason = %next.reason, "next control unavailable");
        }
        Ok(next.is_usable())
    }

    async fn trigger_advance(&mut self) -> Result<(), SourceError> {
        if self.click(&self.selectors.next).await? {
            Ok(())
        } else {
            Err(SourceError::ControlNotFound {
                control: "next".into(),
            })
        }
    }

    async fn force_first_page(&mut self) -> Result<(), SourceError> {
        let location = self.client.current_url().await?;
        if let Some(url) = first_page_url(&location, &self.first_page) {
            info!(%url, "navigating to first page");
            return self.client.navigate(&url).await;
        }

        let first = self.probe().await?.first;
        if first.is_usable() && self.click(&self.selectors.first).await? {
            info!("clicked first page control");
        } else {
            debug!(reason = %first.reason, "already at first page");
        }
        Ok(())
    }
}
