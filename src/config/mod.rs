use serde::Deserialize;
use std::env;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub payment: PaymentConfig,
    pub booking: BookingConfig,
    pub notifications: NotificationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Настройки Redis
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

// Настройки JWT: ядро только проверяет подпись, выпуск токенов снаружи
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub refresh_secret: String,
}

// Настройки платёжного шлюза
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub gateway_url: String,
    pub merchant_id: String,
    pub merchant_password: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub fail_url: String,
    pub webhook_url: String,
    pub currency: String,
}

// Параметры жизненного цикла бронирования
#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    /// TTL мягкой блокировки места, секунды.
    pub lock_ttl_seconds: i64,
    /// Окно оплаты pending-бронирования, минуты.
    pub expiry_minutes: i64,
    /// Дедлайны операций, секунды.
    pub acquire_deadline_seconds: u64,
    pub create_deadline_seconds: u64,
    pub confirm_deadline_seconds: u64,
    /// Количество воркеров генерации билетов.
    pub ticket_workers: usize,
    /// Интервал свипа просроченных блокировок, секунды.
    pub sweep_interval_seconds: u64,
    /// Интервал свипа токенов и ретенции джобов, секунды.
    pub token_sweep_interval_seconds: u64,
}

// Провайдеры доставки билетов; отсутствие ключа отключает под-джобу
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub email_api_key: Option<String>,
    pub sms_api_key: Option<String>,
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

/// Секреты, с которыми нельзя стартовать: пустые или дефолтные значения.
fn require_secret(name: &str) -> String {
    let value = env::var(name).unwrap_or_else(|_| panic!("{} must be set", name));
    let lowered = value.to_lowercase();
    if value.trim().is_empty()
        || matches!(lowered.as_str(), "secret" | "changeme" | "default" | "password")
    {
        panic!("{} is missing or left at a default value", name);
    }
    value
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            app: AppConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8000".to_string())
                    .parse()
                    .expect("PORT must be a valid number"),
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                rust_log: env::var("RUST_LOG")
                    .unwrap_or_else(|_| "bookd=debug,tower_http=debug".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
                pool_size: env::var("DB_POOL_SIZE")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .expect("DB_POOL_SIZE must be a valid number"),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").expect("REDIS_URL must be set"),
            },
            jwt: JwtConfig {
                secret: require_secret("JWT_SECRET"),
                refresh_secret: require_secret("JWT_REFRESH_SECRET"),
            },
            payment: PaymentConfig {
                gateway_url: env::var("PAYMENT_GATEWAY_URL")
                    .expect("PAYMENT_GATEWAY_URL must be set"),
                merchant_id: require_secret("PAYMENT_MERCHANT_ID"),
                merchant_password: require_secret("PAYMENT_MERCHANT_PASSWORD"),
                webhook_secret: require_secret("PAYMENT_WEBHOOK_SECRET"),
                success_url: env::var("PAYMENT_SUCCESS_URL")
                    .unwrap_or_else(|_| "http://localhost:8000/api/v1/payments/success".to_string()),
                fail_url: env::var("PAYMENT_FAIL_URL")
                    .unwrap_or_else(|_| "http://localhost:8000/api/v1/payments/fail".to_string()),
                webhook_url: env::var("PAYMENT_WEBHOOK_URL")
                    .unwrap_or_else(|_| "http://localhost:8000/api/v1/payments/webhook".to_string()),
                currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "KZT".to_string()),
            },
            booking: BookingConfig {
                lock_ttl_seconds: env::var("SEAT_LOCK_TTL_SECONDS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .expect("SEAT_LOCK_TTL_SECONDS must be a valid number"),
                expiry_minutes: env::var("BOOKING_EXPIRY_MINUTES")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .expect("BOOKING_EXPIRY_MINUTES must be a valid number"),
                acquire_deadline_seconds: env::var("LOCK_ACQUIRE_DEADLINE_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("LOCK_ACQUIRE_DEADLINE_SECONDS must be a valid number"),
                create_deadline_seconds: env::var("BOOKING_CREATE_DEADLINE_SECONDS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .expect("BOOKING_CREATE_DEADLINE_SECONDS must be a valid number"),
                confirm_deadline_seconds: env::var("BOOKING_CONFIRM_DEADLINE_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .expect("BOOKING_CONFIRM_DEADLINE_SECONDS must be a valid number"),
                ticket_workers: env::var("TICKET_WORKERS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .expect("TICKET_WORKERS must be a valid number"),
                sweep_interval_seconds: env::var("SWEEP_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .expect("SWEEP_INTERVAL_SECONDS must be a valid number"),
                token_sweep_interval_seconds: env::var("TOKEN_SWEEP_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .expect("TOKEN_SWEEP_INTERVAL_SECONDS must be a valid number"),
            },
            notifications: NotificationConfig {
                email_api_key: env::var("EMAIL_PROVIDER_API_KEY")
                    .ok()
                    .filter(|v| !v.is_empty()),
                sms_api_key: env::var("SMS_PROVIDER_API_KEY")
                    .ok()
                    .filter(|v| !v.is_empty()),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be a valid number"),
                timeout_seconds: env::var("CIRCUIT_BREAKER_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_TIMEOUT_SECONDS must be a valid number"),
            },
        }
    }
}
