use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use crate::block_set::BlockSet;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub identifier: String,
    pub display_name: String,
    pub icon: Option<PathBuf>,
}

/// Source of launchable, user-facing applications.
pub trait AppCatalog: Send + Sync {
    fn list_installed_applications(&self) -> Result<Vec<InstalledApp>>;
}

// Launched from a terminal rather than as an application.
const CONSOLE_PROGRAMS: &[&str] = &[
    "bash", "dash", "fish", "login", "screen", "sh", "ssh", "sshd", "su", "sudo", "tmux", "zsh",
];

const SYSTEM_DIRS: &[&str] = &[
    "/lib/systemd",
    "/sbin",
    "/usr/lib/systemd",
    "/usr/libexec",
    "/usr/sbin",
    "/System",
];

/// Catalog built from the process table. Only applications a user would
/// switch to are listed: `.app` bundles, and elsewhere processes that run
/// in a graphical session outside the system directories.
pub struct ProcessCatalog {
    system: Mutex<System>,
    own_pid: u32,
}

impl ProcessCatalog {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            own_pid: std::process::id(),
        }
    }
}

impl Default for ProcessCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl AppCatalog for ProcessCatalog {
    fn list_installed_applications(&self) -> Result<Vec<InstalledApp>> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::everything(),
        );

        let mut apps: HashMap<String, InstalledApp> = HashMap::new();
        for (pid, process) in system.processes() {
            if pid.as_u32() == self.own_pid {
                continue;
            }
            // Kernel threads and other users' processes have no readable exe.
            let Some(exe) = process.exe() else {
                continue;
            };
            let identifier = process.name().to_string_lossy().trim().to_string();
            if identifier.is_empty() || !is_user_facing(exe, &identifier, process.environ()) {
                continue;
            }

            let bundle = bundle_root(exe);
            let display_name = bundle
                .and_then(bundle_name)
                .unwrap_or_else(|| identifier.clone());
            let icon = bundle.and_then(bundle_icon);
            apps.entry(identifier.clone()).or_insert(InstalledApp {
                identifier,
                display_name,
                icon,
            });
        }

        let mut apps: Vec<InstalledApp> = apps.into_values().collect();
        sort_by_name(&mut apps);
        log::debug!("Process catalog listed {} applications", apps.len());
        Ok(apps)
    }
}

fn is_user_facing(exe: &Path, name: &str, environ: &[OsString]) -> bool {
    if bundle_root(exe).is_some() {
        return true;
    }
    if CONSOLE_PROGRAMS.contains(&name) || SYSTEM_DIRS.iter().any(|dir| exe.starts_with(dir)) {
        return false;
    }
    environ.iter().any(|var| {
        let var = var.to_string_lossy();
        var.starts_with("DISPLAY=") || var.starts_with("WAYLAND_DISPLAY=")
    })
}

/// The outermost `.app` directory holding `exe`.
fn bundle_root(exe: &Path) -> Option<&Path> {
    exe.ancestors()
        .filter(|ancestor| {
            ancestor
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".app"))
        })
        .last()
}

/// "Slack" for "/Applications/Slack.app".
fn bundle_name(bundle: &Path) -> Option<String> {
    bundle
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn bundle_icon(bundle: &Path) -> Option<PathBuf> {
    let icon = bundle.join("Contents/Resources/AppIcon.icns");
    icon.is_file().then_some(icon)
}

fn sort_by_name(apps: &mut [InstalledApp]) {
    apps.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
}

/// Grouping used when picking apps to block.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AppCategory {
    Social,
    Games,
    Entertainment,
    Productivity,
    Other,
}

const CATEGORY_KEYWORDS: &[(AppCategory, &[&str])] = &[
    (
        AppCategory::Social,
        &[
            "discord", "facebook", "instagram", "linkedin", "mastodon", "musically", "pinterest",
            "reddit", "snapchat", "telegram", "threads", "tiktok", "twitter", "whatsapp",
        ],
    ),
    (
        AppCategory::Games,
        &["game", "minecraft", "roblox", "steam", "supercell", "epicgames"],
    ),
    (
        AppCategory::Entertainment,
        &["disney", "hbo", "music", "netflix", "primevideo", "spotify", "twitch", "video", "youtube"],
    ),
    (
        AppCategory::Productivity,
        &[
            "calendar", "docs", "excel", "mail", "notion", "office", "slack", "teams", "todo",
            "trello", "word", "zoom",
        ],
    ),
];

impl AppCategory {
    pub fn label(self) -> &'static str {
        match self {
            AppCategory::Social => "Redes Sociales",
            AppCategory::Games => "Juegos",
            AppCategory::Entertainment => "Entretenimiento",
            AppCategory::Productivity => "Productividad",
            AppCategory::Other => "Otras",
        }
    }

    /// Best guess from the identifier and name; `Other` when nothing matches.
    pub fn classify(app: &InstalledApp) -> Self {
        let haystack = format!("{} {}", app.identifier, app.display_name).to_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|keyword| haystack.contains(keyword)))
            .map(|(category, _)| *category)
            .unwrap_or(AppCategory::Other)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub app: InstalledApp,
    pub category: AppCategory,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryGroup {
    pub category: AppCategory,
    pub label: &'static str,
    pub apps: Vec<CatalogEntry>,
}

/// Case-insensitive name filter over `apps`, flagging current block-set
/// members. A blank query returns everything.
pub fn search(apps: &[InstalledApp], query: &str, block_set: &BlockSet) -> Vec<CatalogEntry> {
    let needle = query.trim().to_lowercase();
    let mut entries: Vec<CatalogEntry> = apps
        .iter()
        .filter(|app| needle.is_empty() || app.display_name.to_lowercase().contains(&needle))
        .map(|app| CatalogEntry {
            app: app.clone(),
            category: AppCategory::classify(app),
            blocked: block_set.contains(&app.identifier),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.app
            .display_name
            .to_lowercase()
            .cmp(&b.app.display_name.to_lowercase())
    });
    entries
}

/// Split search results by category, in category order. Empty categories
/// are left out; entries keep their order.
pub fn group_by_category(entries: Vec<CatalogEntry>) -> Vec<CategoryGroup> {
    let mut groups: Vec<CategoryGroup> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|group| group.category == entry.category) {
            Some(group) => group.apps.push(entry),
            None => groups.push(CategoryGroup {
                category: entry.category,
                label: entry.category.label(),
                apps: vec![entry],
            }),
        }
    }
    groups.sort_by_key(|group| group.category);
    groups
}

/// Lookup table used to name blocked identifiers when settings arrive.
pub fn name_index(apps: Vec<InstalledApp>) -> HashMap<String, String> {
    apps.into_iter()
        .map(|app| (app.identifier, app.display_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_set::BlockedTarget;

    fn app(identifier: &str, name: &str) -> InstalledApp {
        InstalledApp {
            identifier: identifier.into(),
            display_name: name.into(),
            icon: None,
        }
    }

    fn env(vars: &[&str]) -> Vec<OsString> {
        vars.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_search_filters_and_flags_blocked() {
        let apps = vec![
            app("com.reddit.frontpage", "Reddit"),
            app("com.instagram.android", "Instagram"),
            app("org.mozilla.firefox", "Firefox"),
        ];
        let block_set = BlockSet::new();
        block_set.replace(vec![BlockedTarget::new("com.instagram.android", "Instagram")]);

        let all = search(&apps, "  ", &block_set);
        let names: Vec<&str> = all.iter().map(|e| e.app.display_name.as_str()).collect();
        assert_eq!(names, vec!["Firefox", "Instagram", "Reddit"]);

        let hits = search(&apps, "INSTA", &block_set);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].blocked);
        assert_eq!(hits[0].category, AppCategory::Social);

        let hits = search(&apps, "fire", &block_set);
        assert!(!hits[0].blocked);
        assert_eq!(hits[0].category, AppCategory::Other);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            AppCategory::classify(&app("com.zhiliaoapp.musically", "TikTok")),
            AppCategory::Social
        );
        assert_eq!(
            AppCategory::classify(&app("com.supercell.clashroyale", "Clash Royale")),
            AppCategory::Games
        );
        assert_eq!(
            AppCategory::classify(&app("com.google.android.youtube", "YouTube")),
            AppCategory::Entertainment
        );
        assert_eq!(AppCategory::classify(&app("Slack", "Slack")), AppCategory::Productivity);
        assert_eq!(AppCategory::classify(&app("org.gnu.emacs", "Emacs")), AppCategory::Other);
    }

    #[test]
    fn test_group_by_category() {
        let apps = vec![
            app("org.mozilla.firefox", "Firefox"),
            app("com.spotify.music", "Spotify"),
            app("com.reddit.frontpage", "Reddit"),
            app("com.instagram.android", "Instagram"),
        ];
        let groups = group_by_category(search(&apps, "", &BlockSet::new()));

        let labels: Vec<&str> = groups.iter().map(|g| g.label).collect();
        assert_eq!(labels, vec!["Redes Sociales", "Entretenimiento", "Otras"]);
        let social: Vec<&str> = groups[0].apps.iter().map(|e| e.app.display_name.as_str()).collect();
        assert_eq!(social, vec!["Instagram", "Reddit"]);
        assert!(group_by_category(Vec::new()).is_empty());
    }

    #[test]
    fn test_bundle_paths() {
        let exe = Path::new("/Applications/Slack.app/Contents/MacOS/Slack Helper");
        let bundle = bundle_root(exe).unwrap();
        assert_eq!(bundle, Path::new("/Applications/Slack.app"));
        assert_eq!(bundle_name(bundle).as_deref(), Some("Slack"));

        let nested = Path::new(
            "/Applications/Xcode.app/Contents/Developer/Simulator.app/Contents/MacOS/Simulator",
        );
        assert_eq!(bundle_root(nested), Some(Path::new("/Applications/Xcode.app")));
        assert_eq!(bundle_root(Path::new("/usr/bin/firefox")), None);
    }

    #[test]
    fn test_user_facing_filter() {
        let graphical = env(&["HOME=/home/ana", "WAYLAND_DISPLAY=wayland-0"]);

        assert!(is_user_facing(
            Path::new("/Applications/Slack.app/Contents/MacOS/Slack"),
            "Slack",
            &[]
        ));
        assert!(is_user_facing(Path::new("/usr/lib/firefox/firefox"), "firefox", &graphical));
        assert!(is_user_facing(Path::new("/opt/spotify/spotify"), "spotify", &graphical));
        let headless = env(&["HOME=/root"]);
        assert!(!is_user_facing(Path::new("/opt/spotify/spotify"), "spotify", &headless));
        assert!(!is_user_facing(Path::new("/usr/bin/bash"), "bash", &graphical));
        assert!(!is_user_facing(Path::new("/usr/libexec/gvfsd"), "gvfsd", &graphical));
        assert!(!is_user_facing(Path::new("/usr/sbin/cron"), "cron", &[]));
    }

    #[test]
    fn test_name_index() {
        let index = name_index(vec![app("com.reddit.frontpage", "Reddit")]);
        assert_eq!(index.get("com.reddit.frontpage").map(String::as_str), Some("Reddit"));
    }

    #[test]
    fn test_process_catalog_is_sorted_and_unique() {
        let apps = ProcessCatalog::new().list_installed_applications().unwrap();
        let mut ids: Vec<&str> = apps.iter().map(|a| a.identifier.as_str()).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert!(ids.iter().all(|id| !CONSOLE_PROGRAMS.contains(id)));

        let names: Vec<String> = apps.iter().map(|a| a.display_name.to_lowercase()).collect();
        assert!(names.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
