use url::Url;

use crate::actions::Action;
use crate::store::Store;

/// Builds `<cmdchar>play <args>` from a launch URL carrying `cmd=play` and any
/// number of `arg=` parameters. Other commands are ignored.
#[must_use]
pub fn play_command_from_url(url: &str, cmdchar: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let cmd = url
        .query_pairs()
        .find(|(key, _)| key == "cmd")
        .map(|(_, value)| value)?;
    if cmd != "play" {
        return None;
    }

    let args: Vec<String> = url
        .query_pairs()
        .filter(|(key, _)| key == "arg")
        .map(|(_, value)| value.into_owned())
        .collect();
    Some(format!("{cmdchar}{cmd} {}", args.join(" ")))
}

/// Seeds the editor from a launch URL. Returns whether anything was set.
pub fn populate_editor_from_url(store: &Store, url: &str, cmdchar: &str) -> bool {
    let Some(command) = play_command_from_url(url, cmdchar) else {
        return false;
    };
    store.dispatch(Action::SetEditorContent(command));
    true
}
