use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::http::ApiClient;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use crossterm::event::{DisableFocusChange, EnableFocusChange, KeyCode, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::ExecutableCommand;
use serde_json::Value;
use std::io::{stdout, Write};
use std::sync::Arc;
use std::time::Duration;
use swrc::cache::{KeyValueStore, NoopKvStore, SqliteKvStore};
use swrc::network::probe::{self, ProbeConfig};
use swrc::network::{ManualNetworkSignal, NetworkStatus};
use swrc::swr::FocusEvents;
use swrc::{Query, QueryOptions, QueryState, SwrClient};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wiring between the config, the HTTP client and the cache client.
pub struct App {
  config: Config,
  api: ApiClient,
  client: SwrClient,
  focus: FocusEvents,
  network: Arc<ManualNetworkSignal>,
  probe: Option<JoinHandle<()>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let api = ApiClient::new(&config)?;
    let focus = FocusEvents::new();
    let network = Arc::new(ManualNetworkSignal::unknown());

    let client = SwrClient::builder()
      .durable(open_store(&config))
      .network(network.clone())
      .focus(Arc::new(focus.clone()))
      .defaults(config.cache.query_options())
      .build();

    Ok(Self {
      config,
      api,
      client,
      focus,
      network,
      probe: None,
    })
  }

  /// Probe once so the first freshness decision sees real connectivity,
  /// then keep probing in the background.
  pub async fn start_probe(&mut self) {
    let Some(config) = self.probe_config() else {
      return;
    };
    let info = probe::probe_once(self.api.http(), &config).await;
    self.network.set(info);
    self.probe = Some(probe::spawn_probe(
      self.api.http().clone(),
      config,
      self.network.clone(),
    ));
  }

  fn probe_config(&self) -> Option<ProbeConfig> {
    let url = self.config.network.probe_url.clone()?;
    Some(ProbeConfig {
      url,
      interval: Duration::from_millis(self.config.network.probe_interval_ms),
      timeout: Duration::from_millis(self.config.network.timeout_ms),
      save_data: self.config.network.save_data,
    })
  }

  pub fn options(&self) -> QueryOptions {
    self.client.defaults().clone()
  }

  /// Print the cached value if any, then the revalidated one.
  pub async fn get(&self, url: &str, options: QueryOptions) -> Result<()> {
    let mut query = self.get_json(url, options);

    let state = query.state();
    if let Some(data) = &state.data {
      print_value(&describe(&state, &self.client.network_status()), data)?;
    }
    if !state.loading {
      return Ok(());
    }

    while query.is_loading() {
      if !query.changed().await {
        break;
      }
    }

    let state = query.state();
    match (&state.data, &state.error) {
      (_, Some(e)) if state.data.is_none() => Err(eyre!("{}", e)),
      (Some(data), error) => {
        if let Some(e) = error {
          eprintln!("warning: showing cached data, {}", e);
        }
        print_value("revalidated", data)
      }
      (None, _) => Err(eyre!("No data for {}", url)),
    }
  }

  /// Follow `url` in raw mode until the user quits.
  pub async fn watch(&self, url: &str, options: QueryOptions) -> Result<()> {
    let mut query = self.get_json(url, options);

    enable_raw_mode()?;
    stdout().execute(EnableFocusChange)?;
    let result = self.watch_loop(&mut query).await;
    stdout().execute(DisableFocusChange)?;
    disable_raw_mode()?;

    result
  }

  async fn watch_loop(&self, query: &mut Query<Value>) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(250), self.focus.clone());
    let mut last_shown = None;
    write_line("watching; r revalidates, q quits")?;

    loop {
      let state = query.state();
      if last_shown.as_ref() != Some(&state) {
        self.render(&state)?;
        last_shown = Some(state);
      }

      tokio::select! {
        event = events.next() => {
          let Some(event) = event else {
            break;
          };
          match event {
            Event::Key(key) => match key.code {
              KeyCode::Char('q') | KeyCode::Esc => break,
              KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
              KeyCode::Char('r') => query.mutate(None)?,
              _ => {}
            },
            Event::FocusGained => info!("Terminal regained focus"),
            Event::Tick => {}
          }
        }
        changed = query.changed() => {
          if !changed {
            break;
          }
        }
      }
    }

    Ok(())
  }

  fn render(&self, state: &QueryState<Value>) -> Result<()> {
    let status = self.client.network_status();
    let heading = describe(state, &status);
    match (&state.data, &state.error) {
      (Some(data), _) => {
        let body = serde_json::to_string_pretty(data)?;
        write_line(&format!("--- {} ---", heading))?;
        for line in body.lines() {
          write_line(line)?;
        }
      }
      (None, Some(e)) => write_line(&format!("--- {} --- {}", heading, e))?,
      (None, None) => write_line(&format!("--- {} ---", heading))?,
    }
    Ok(())
  }

  /// Print every item of a cursor-paginated endpoint, one JSON value per line.
  pub async fn pages(&self, url: &str, max_pages: usize, options: QueryOptions) -> Result<()> {
    let api = self.api.clone();
    let base = url.to_string();
    let mut query = self.client.get_paginated(
      format!("pages:{}", url),
      move |cursor: Option<String>| {
        let api = api.clone();
        let base = base.clone();
        async move { api.get_page(&base, cursor.as_deref()).await }
      },
      options,
    );

    while query.first().is_loading() {
      if !query.changed().await {
        break;
      }
    }
    if let Some(e) = query.error() {
      if query.first().data().is_none() {
        return Err(eyre!("{}", e));
      }
      eprintln!("warning: showing cached first page, {}", e);
    }

    let mut loaded = 1;
    while loaded < max_pages && query.has_more() {
      query.load_more().await.map_err(|e| eyre!("{}", e))?;
      loaded += 1;
    }

    for item in query.data() {
      println!("{}", serde_json::to_string(&item)?);
    }
    info!(pages = loaded, items = query.total_loaded(), "Listed pages");
    if query.has_more() {
      eprintln!("more pages available; raise --max-pages to continue");
    }
    Ok(())
  }

  pub fn invalidate(&self, prefix: &str) -> Result<()> {
    let removed = self.client.invalidate(prefix);
    println!("removed {} cached entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
  }

  pub fn status(&self) -> Result<()> {
    let status = self.client.network_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
  }

  fn get_json(&self, url: &str, options: QueryOptions) -> Query<Value> {
    let api = self.api.clone();
    let target = url.to_string();
    self.client.get(
      url,
      move || {
        let api = api.clone();
        let target = target.clone();
        async move { api.get_json(&target).await }
      },
      options,
    )
  }
}

impl Drop for App {
  fn drop(&mut self) {
    if let Some(probe) = self.probe.take() {
      probe.abort();
    }
  }
}

/// Durable tier per config; falls back to memory only when SQLite can't be opened.
fn open_store(config: &Config) -> Arc<dyn KeyValueStore> {
  if !config.cache.persist {
    return Arc::new(NoopKvStore);
  }

  let opened = match &config.cache.db_path {
    Some(path) => SqliteKvStore::open(path),
    None => SqliteKvStore::open_default(),
  };
  match opened {
    Ok(store) => Arc::new(store.with_quota(config.cache.quota_bytes())),
    Err(e) => {
      warn!("Cache database unavailable, caching in memory only: {}", e);
      Arc::new(NoopKvStore)
    }
  }
}

fn describe(state: &QueryState<Value>, network: &NetworkStatus) -> String {
  let age = state
    .updated_at
    .map(|at| format!("{}s old", (Utc::now() - at).num_seconds().max(0)))
    .unwrap_or_else(|| "no data".to_string());
  let activity = if state.is_initial_loading {
    ", loading"
  } else if state.is_revalidating {
    ", revalidating"
  } else {
    ""
  };
  format!("{}{} [{}]", age, activity, network.quality)
}

fn print_value(heading: &str, value: &Value) -> Result<()> {
  eprintln!("--- {} ---", heading);
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Raw mode needs explicit carriage returns.
fn write_line(line: &str) -> Result<()> {
  let mut out = stdout();
  write!(out, "{}\r\n", line)?;
  out.flush()?;
  Ok(())
}
