//! Inline keyboards.
//!
//! All interactive choices go through inline keyboards whose callback data
//! encodes `<kind>:<args>`, routed back in `Bridge::handle_callback`.

use crate::backend::{self, BackendKind};
use crate::config::Config;
use crate::telegram::{InlineKeyboardButton, InlineKeyboardMarkup};

/// A window row in the session list.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub window_id: String,
    pub display_name: String,
    /// Topic key the window is bound to, empty when free.
    pub bound_topic: String,
}

/// One button per enabled backend.
#[must_use]
pub fn backend_keyboard(cfg: &Config) -> InlineKeyboardMarkup {
    let row = BackendKind::SELECTABLE
        .iter()
        .filter(|kind| backend::is_enabled(**kind, cfg))
        .map(|kind| InlineKeyboardButton::new(kind.as_str(), format!("backend:{kind}")))
        .collect();
    InlineKeyboardMarkup {
        inline_keyboard: vec![row],
    }
}

/// Favorites, recent directories, and a manual-input escape hatch.
#[must_use]
pub fn dir_keyboard(favorites: &[String], recent: &[String]) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();

    for dir in favorites {
        rows.push(vec![InlineKeyboardButton::new(
            format!("⭐ {}", shorten_path(dir)),
            format!("dir:{dir}"),
        )]);
    }
    for dir in recent {
        if favorites.contains(dir) {
            continue;
        }
        rows.push(vec![InlineKeyboardButton::new(
            format!("🕐 {}", shorten_path(dir)),
            format!("dir:{dir}"),
        )]);
    }
    rows.push(vec![InlineKeyboardButton::new(
        "📁 Enter a path...",
        "dir_input",
    )]);

    InlineKeyboardMarkup {
        inline_keyboard: rows,
    }
}

/// Yes / No / Always for permission prompts.
#[must_use]
pub fn confirm_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![
            InlineKeyboardButton::new("✅ Yes", format!("confirm:yes:{window_id}")),
            InlineKeyboardButton::new("❌ No", format!("confirm:no:{window_id}")),
            InlineKeyboardButton::new("🔓 Always", format!("confirm:always:{window_id}")),
        ]],
    }
}

/// Existing windows with bind / kill actions, plus a new-session button.
#[must_use]
pub fn session_list_keyboard(sessions: &[SessionInfo]) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    for s in sessions {
        if s.bound_topic.is_empty() {
            rows.push(vec![
                InlineKeyboardButton::new(format!("💤 {}", s.display_name), "noop"),
                InlineKeyboardButton::new("🔗 Bind", format!("bind:{}", s.window_id)),
            ]);
        } else {
            rows.push(vec![
                InlineKeyboardButton::new(format!("🔗 {}", s.display_name), "noop"),
                InlineKeyboardButton::new("❌ Kill", format!("kill:{}", s.window_id)),
            ]);
        }
    }
    rows.push(vec![InlineKeyboardButton::new(
        "➕ New session",
        "new_session",
    )]);
    InlineKeyboardMarkup {
        inline_keyboard: rows,
    }
}

/// Subdirectory browser with favorite shortcuts.
#[must_use]
pub fn browse_dir_keyboard(current_path: &str, entries: &[String]) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    for name in entries {
        let full = if current_path == "/" {
            format!("/{name}")
        } else {
            format!("{current_path}/{name}")
        };
        rows.push(vec![
            InlineKeyboardButton::new(format!("📂 {name}"), format!("browse:{full}")),
            InlineKeyboardButton::new("⭐", format!("fav:{full}")),
        ]);
    }
    rows.push(vec![InlineKeyboardButton::new(
        "✅ Use this directory",
        format!("dir:{current_path}"),
    )]);
    if current_path != "/" {
        rows.push(vec![InlineKeyboardButton::new(
            "⬆️ Up one level",
            format!("browse:{}", parent_dir(current_path)),
        )]);
    }
    InlineKeyboardMarkup {
        inline_keyboard: rows,
    }
}

/// Terminal control keys attached to screenshots (`ss:` callbacks).
#[must_use]
pub fn screenshot_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    nav_style_keyboard("ss", window_id)
}

/// Terminal control keys for interactive selectors (`nav:` callbacks).
#[must_use]
pub fn interactive_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    nav_style_keyboard("nav", window_id)
}

fn nav_style_keyboard(prefix: &str, window_id: &str) -> InlineKeyboardMarkup {
    let btn = |label: &str, action: &str| {
        InlineKeyboardButton::new(label, format!("{prefix}:{action}:{window_id}"))
    };
    InlineKeyboardMarkup {
        inline_keyboard: vec![
            vec![btn("⬆️", "up"), btn("⬇️", "down"), btn("⬅️", "left"), btn("➡️", "right")],
            vec![btn("↵ Enter", "enter"), btn("⎋ Esc", "esc"), btn("⇥ Tab", "tab"), btn("␣ Space", "space")],
            vec![btn("y", "y"), btn("n", "n"), btn("^C", "ctrlc"), btn("🔄", "refresh")],
        ],
    }
}

/// Shorten long paths to their tail for button labels.
#[must_use]
pub fn shorten_path(path: &str) -> String {
    if path.len() <= 40 {
        return path.to_string();
    }
    let tail: String = path
        .chars()
        .rev()
        .take(37)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}
