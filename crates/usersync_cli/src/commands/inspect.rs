//! Inspect command implementation.

use super::{load_queue, open_prefs};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use usersync_engine::UserStores;
use usersync_storage::{keys, PreferenceStore};

/// Inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Preference file path.
    pub path: String,
    /// Configured app id.
    pub app_id: Option<String>,
    /// Current user's id.
    pub onesignal_id: Option<String>,
    /// Current user's external id.
    pub external_id: Option<String>,
    /// The device's push subscription id.
    pub push_subscription_id: Option<String>,
    /// Every persisted model store.
    pub stores: Vec<StoreStats>,
    /// The current user's subscriptions.
    pub subscriptions: Vec<SubscriptionInfo>,
    /// Number of pending operations.
    pub pending_operations: usize,
    /// Number of recorded id promotions.
    pub id_translations: usize,
}

/// Summary of one persisted model store.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    /// Store name.
    pub name: String,
    /// Number of persisted models; `None` if the entry is unreadable.
    pub models: Option<usize>,
}

/// One subscription.
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: String,
    /// Channel.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Token, address or number.
    pub address: String,
    /// Opt-in choice.
    pub opted_in: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let prefs = open_prefs(path)?;
    let result = inspect(&path.display().to_string(), &prefs)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the inspection result from `prefs`.
pub fn inspect(
    path: &str,
    prefs: &Arc<dyn PreferenceStore>,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut stores = Vec::new();
    for key in prefs.keys(keys::SCOPE)? {
        let Some(name) = key.strip_prefix(keys::MODEL_STORE_PREFIX) else {
            continue;
        };
        let models = match prefs.get_string(keys::SCOPE, &key)? {
            Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(serde_json::Value::Array(items)) => Some(items.len()),
                _ => {
                    tracing::warn!(store = name, "unreadable model store");
                    None
                }
            },
            None => Some(0),
        };
        stores.push(StoreStats {
            name: name.to_string(),
            models,
        });
    }
    stores.sort_by(|a, b| a.name.cmp(&b.name));

    let user = UserStores::open(Some(Arc::clone(prefs)));
    let config = user.config.model();
    let identity = user.identity.model();
    let subscriptions = user
        .subscriptions
        .list()
        .iter()
        .map(|s| SubscriptionInfo {
            id: s.id().unwrap_or_default().to_string(),
            kind: s.kind().as_str(),
            address: s.address().to_string(),
            opted_in: s.opted_in(),
        })
        .collect();

    let queue = load_queue(prefs);
    Ok(InspectResult {
        path: path.to_string(),
        app_id: config.app_id().map(str::to_string),
        onesignal_id: identity.onesignal_id().map(str::to_string),
        external_id: identity.external_id().map(str::to_string),
        push_subscription_id: config.push_subscription_id().map(str::to_string),
        stores,
        subscriptions,
        pending_operations: queue.len(),
        id_translations: queue.translations().len(),
    })
}

fn print_text_output(result: &InspectResult) {
    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("usersync State Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("User:");
    println!("  App id:        {}", show(&result.app_id));
    println!("  OneSignal id:  {}", show(&result.onesignal_id));
    println!("  External id:   {}", show(&result.external_id));
    println!("  Push sub id:   {}", show(&result.push_subscription_id));
    println!();
    println!("Stores:");
    for store in &result.stores {
        match store.models {
            Some(count) => println!("  {:<14} {} models", store.name, count),
            None => println!("  {:<14} unreadable", store.name),
        }
    }
    if !result.subscriptions.is_empty() {
        println!();
        println!("Subscriptions:");
        for sub in &result.subscriptions {
            let opted = if sub.opted_in { "opted in" } else { "opted out" };
            println!("  [{}] {} {} ({})", sub.kind, sub.id, sub.address, opted);
        }
    }
    println!();
    println!("Queue:");
    println!("  Pending operations: {}", result.pending_operations);
    println!("  Id translations:    {}", result.id_translations);
}
