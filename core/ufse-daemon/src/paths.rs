use std::path::PathBuf;

const UFSE_DIR: &str = ".ufse";
const SOCKET_NAME: &str = "daemon.sock";
const INCIDENTS_NAME: &str = "incidents.jsonl";

fn ufse_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(UFSE_DIR))
}

pub fn socket_path() -> Result<PathBuf, String> {
    Ok(ufse_dir()?.join(SOCKET_NAME))
}

pub fn incidents_path() -> Result<PathBuf, String> {
    Ok(ufse_dir()?.join(INCIDENTS_NAME))
}
