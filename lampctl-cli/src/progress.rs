use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lampctl::upload::UploadProgressFn;

/// Runs an upload action with an optional byte-progress bar.
///
/// The bar is registered on the shared [`MultiProgress`] so log lines do
/// not tear it.
pub fn with_upload_progress<T>(
    multi: &MultiProgress,
    show: bool,
    total: u64,
    action: impl FnOnce(Option<Box<UploadProgressFn>>) -> T,
) -> T {
    if show {
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(
                "{wide_bar} {decimal_bytes:>9} / {decimal_total_bytes:9} ({decimal_bytes_per_sec:9})",
            )
            .unwrap(),
        );

        let callback_bar = bar.clone();
        let result = action(Some(Box::new(move |progress| {
            callback_bar.set_length(progress.declared_size);
            callback_bar.set_position(progress.file_bytes);
        })));

        bar.finish();
        result
    } else {
        action(None)
    }
}
