use indicatif::{ProgressBar, ProgressStyle};

const BYTES_TEMPLATE: &str =
    "[{elapsed_precise}] {msg} {spinner:.green} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} eta: {eta}";
const COUNT_TEMPLATE: &str =
    "[{elapsed_precise}] {msg} {spinner:.green} [{wide_bar:.cyan/blue}] {pos}/{len} eta: {eta}";
const SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {msg} {spinner:.green}";

fn create_progress_bar(
    quiet_mode: bool,
    msg: &str,
    length: Option<u64>,
    template: &str,
) -> ProgressBar {
    let bar = match (quiet_mode, length) {
        (true, _) => ProgressBar::hidden(),
        (false, Some(len)) => ProgressBar::new(len),
        (false, None) => ProgressBar::new_spinner(),
    };

    bar.set_message(msg);
    match length.is_some() {
        true => bar.set_style(
            ProgressStyle::default_bar()
                .template(template)
                .progress_chars("=> "),
        ),
        false => bar.set_style(ProgressStyle::default_spinner().template(SPINNER_TEMPLATE)),
    };

    bar.inc(0); // Just to avoid the drawing after the log.

    bar
}

/// Byte-based bar for file reads.
pub fn create_progress_bar_bytes(quiet_mode: bool, msg: &str, length: Option<u64>) -> ProgressBar {
    create_progress_bar(quiet_mode, msg, length, BYTES_TEMPLATE)
}

/// Row-based bar for the scoring loop.
pub fn create_progress_bar_count(quiet_mode: bool, msg: &str, length: Option<u64>) -> ProgressBar {
    create_progress_bar(quiet_mode, msg, length, COUNT_TEMPLATE)
}
