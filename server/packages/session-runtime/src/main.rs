fn main() {
    if let Err(err) = session_runtime::cli::run_session_runtime() {
        tracing::error!(error = %err, "session-runtime failed");
        std::process::exit(1);
    }
}
