use crate::config::DatabaseConfig;
use crate::errors::AppError;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

/// 建立 MongoDB 连接，返回客户端句柄与业务库
///
/// 句柄本身是连接池，可 clone 后在多个组件间共享
pub async fn connect_mongo(config: &DatabaseConfig) -> Result<(Client, Database), AppError> {
    if config.url.is_empty() || config.db_name.is_empty() {
        return Err(AppError::Precondition("database url/db_name is empty".to_string()));
    }
    let options = ClientOptions::parse(&config.url).await?;
    let client = Client::with_options(options)?;
    let db = client.database(&config.db_name);
    Ok((client, db))
}

/// 健康检查
pub async fn ping_mongo(db: &Database) -> Result<(), AppError> {
    db.run_command(doc! { "ping": 1 }).await?;
    Ok(())
}
