use trellis_controller::ControllerApp;

#[tokio::main]
async fn main() {
    if let Err(e) = ControllerApp::run().await {
        eprintln!("\nError: {}\n", e);
        std::process::exit(1);
    }
}
