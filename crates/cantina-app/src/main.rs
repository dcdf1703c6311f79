#[tokio::main]
async fn main() {
    let exit_code = cantina_app::run().await;
    std::process::exit(exit_code);
}
