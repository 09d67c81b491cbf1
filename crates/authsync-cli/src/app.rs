//! Wiring and command handlers for the CLI.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use authsync_core::api::supabase::AUTO_REFRESH_TICK;
use authsync_core::cache::MemoryCache;
use authsync_core::{
    AuthActions, AuthState, Config, GuardDecision, IdentityClient, PersistentCache, RouteGuard,
    SessionStore, SignUpResult, SnapshotCache, SupabaseClient, UnconfiguredClient,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Password taken from the environment instead of prompting.
const PASSWORD_ENV: &str = "AUTHSYNC_PASSWORD";

/// Longest we wait on the provider before printing what we have.
const PROVIDER_WAIT_LIMIT: Duration = Duration::from_secs(20);

/// Slack after the confirmation delay before we check for the refresh.
const CONFIRMATION_SLACK: Duration = Duration::from_millis(50);

pub struct App {
    config: Config,
    store: SessionStore,
    actions: AuthActions,
    provider: Option<Arc<SupabaseClient>>,
    background: Vec<JoinHandle<()>>,
    json: bool,
}

impl App {
    pub fn new(ephemeral: bool, json: bool) -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;

        let cache: Arc<dyn PersistentCache> = if ephemeral {
            Arc::new(MemoryCache::new()) as Arc<dyn PersistentCache>
        } else {
            config.open_cache().context("Failed to open session cache")?
        };

        let provider = match config.provider() {
            Some((url, key)) => {
                let client = SupabaseClient::new(url, key, cache.clone())
                    .context("Failed to create identity provider client")?;
                Some(Arc::new(client))
            }
            None => {
                warn!("No identity provider configured (set SUPABASE_URL and SUPABASE_ANON_KEY)");
                None
            }
        };
        let client: Arc<dyn IdentityClient> = match &provider {
            Some(supabase) => Arc::clone(supabase) as Arc<dyn IdentityClient>,
            None => Arc::new(UnconfiguredClient::new()),
        };

        let store = SessionStore::new(client, SnapshotCache::new(cache));
        let actions = AuthActions::new(store.clone(), config.action_options());

        Ok(Self {
            config,
            store,
            actions,
            provider,
            background: Vec::new(),
            json,
        })
    }

    pub fn shutdown(&mut self) {
        self.store.shutdown();
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn status(&mut self) -> Result<()> {
        if let Some(cached) = self.store.cache().load() {
            debug!(age = %cached.saved_ago(), "Cached snapshot present");
            if !self.json {
                println!("Cached session saved {}", cached.saved_ago());
            }
        }

        let since = self.store.settled_refreshes();
        self.store.initialize();
        let seeded = self.store.get_auth_state();
        if seeded.is_authenticated() {
            self.print_state("cached", &seeded);
        }

        self.wait_for_settled(since).await;
        self.print_state("provider", &self.store.get_auth_state());
        Ok(())
    }

    pub async fn login(&mut self, email: Option<String>, return_to: Option<String>) -> Result<()> {
        self.store.initialize();

        let email = match email {
            Some(email) => email,
            None => prompt_email(self.config.last_email.as_deref())?,
        };
        let password = read_password()?;

        let outcome = self
            .actions
            .sign_in_returning_to(&email, &password, return_to.as_deref())
            .await
            .map_err(|e| anyhow!("Sign-in failed: {}", e))?;

        println!("Signed in as {}", outcome.user.display_name());
        println!("Continue to {}", outcome.navigate_to);

        if let Err(e) = remember_email(&email) {
            warn!(error = %e, "Failed to save last email");
        }

        self.wait_for_confirmation().await;
        Ok(())
    }

    pub async fn signup(&mut self, email: String) -> Result<()> {
        self.store.initialize();
        let password = read_password()?;

        match self
            .actions
            .sign_up(&email, &password)
            .await
            .map_err(|e| anyhow!("Sign-up failed: {}", e))?
        {
            SignUpResult::SignedIn { user, navigate_to } => {
                println!("Account created, signed in as {}", user.display_name());
                println!("Continue to {}", navigate_to);
                self.wait_for_confirmation().await;
            }
            SignUpResult::ConfirmationRequired { email } => {
                println!("Check {} for a confirmation link, then run `authsync login`", email);
            }
        }
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        let outcome = self.actions.sign_out().await;
        match outcome.remote_error {
            Some(kind) => println!("Signed out locally (provider sign-out failed: {})", kind),
            None => println!("Signed out"),
        }
        println!("Continue to {}", outcome.navigate_to);
        Ok(())
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.store.initialize();
        self.wait_for_idle().await;

        let outcome = self.store.reload().await;
        debug!(?outcome, "Reload finished");
        self.print_state("provider", &self.store.get_auth_state());
        Ok(())
    }

    pub async fn guard(&mut self, location: String) -> Result<()> {
        self.store.initialize();
        let mut guard = RouteGuard::new(self.store.clone(), self.config.guard_options(), location);

        let mut decision = guard.mount();
        loop {
            if decision == (GuardDecision::Checking { timed_out: false }) {
                decision = guard.resolve().await;
            }
            if decision != (GuardDecision::Checking { timed_out: true }) {
                break;
            }

            eprintln!(
                "Still checking the session after {}ms.",
                self.config.guard_timeout_ms
            );
            let keep_waiting = tokio::task::spawn_blocking(|| confirm("Continue waiting?"))
                .await
                .context("Prompt task failed")??;
            if !keep_waiting {
                break;
            }
            decision = guard.continue_anyway();
        }

        self.print_decision(guard.location(), &decision);
        Ok(())
    }

    pub async fn watch(&mut self) -> Result<()> {
        let json = self.json;
        let subscription = self.store.subscribe(move |state| print_change(state, json));

        self.store.initialize();
        if let Some(supabase) = &self.provider {
            self.background.push(supabase.spawn_auto_refresh(AUTO_REFRESH_TICK));
        }
        self.print_state("current", &self.store.get_auth_state());

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        subscription.unsubscribe();
        Ok(())
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Wait until a refresh newer than `since` has settled.
    async fn wait_for_settled(&self, since: u64) {
        let mut changes = self.store.watch();
        let wait = async {
            while self.store.settled_refreshes() <= since {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(PROVIDER_WAIT_LIMIT, wait).await.is_err() {
            warn!("Provider did not answer within {:?}", PROVIDER_WAIT_LIMIT);
        }
    }

    /// Wait until no refresh is outstanding.
    async fn wait_for_idle(&self) {
        let mut changes = self.store.watch();
        let wait = async {
            while self.store.refresh_in_flight() {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(PROVIDER_WAIT_LIMIT, wait).await.is_err() {
            warn!("Provider did not answer within {:?}", PROVIDER_WAIT_LIMIT);
        }
    }

    /// Let the confirmation refresh run before the process exits.
    async fn wait_for_confirmation(&self) {
        let delay = self.actions.options().confirm_refresh_delay;
        tokio::time::sleep(delay + CONFIRMATION_SLACK).await;
        self.wait_for_idle().await;

        let state = self.store.get_auth_state();
        if !state.is_authenticated() {
            eprintln!("The provider no longer reports a session; you are signed out.");
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn print_state(&self, source: &str, state: &AuthState) {
        if self.json {
            let value = serde_json::json!({ "source": source, "state": state });
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{}", text),
                Err(e) => warn!(error = %e, "Failed to serialize state"),
            }
        } else {
            println!("[{}] {}", source, describe(state));
        }
    }

    fn print_decision(&self, location: &str, decision: &GuardDecision) {
        if self.json {
            match serde_json::to_string_pretty(decision) {
                Ok(text) => println!("{}", text),
                Err(e) => warn!(error = %e, "Failed to serialize decision"),
            }
            return;
        }
        match decision {
            GuardDecision::Granted => println!("granted: {}", location),
            GuardDecision::Checking { .. } => println!("checking: {} (session not confirmed)", location),
            GuardDecision::Denied {
                redirect_to,
                return_to,
            } => println!("denied: sign in at {}, then return to {}", redirect_to, return_to),
        }
    }
}

fn describe(state: &AuthState) -> String {
    let mut line = match (state.user(), state.session()) {
        (Some(user), Some(session)) => format!(
            "Signed in as {} (session expires in {}m)",
            user.display_name(),
            session.minutes_until_expiry()
        ),
        _ if state.loading => "Checking session...".to_string(),
        _ => "Signed out".to_string(),
    };
    if let Some(error) = &state.error {
        line.push_str(&format!(" [{}: {}]", error.kind, error.message));
    }
    line
}

fn print_change(state: &AuthState, json: bool) {
    if json {
        match serde_json::to_string(state) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize state"),
        }
    } else {
        println!("{}", describe(state));
    }
}

// ============================================================================
// Prompts
// ============================================================================

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => {
            let input = prompt(&format!("Email [{}]: ", last))?;
            Ok(if input.is_empty() { last.to_string() } else { input })
        }
        None => prompt("Email: "),
    }
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(&format!("{} [y/N] ", question))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Save the email to the config file without writing environment overrides.
fn remember_email(email: &str) -> Result<()> {
    let path = Config::config_path()?;
    let mut stored = Config::load_from(&path)?;
    stored.last_email = Some(email.trim().to_string());
    stored.save_to(&path)
}
