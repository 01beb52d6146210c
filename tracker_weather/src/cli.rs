use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tracker-weather",
    version,
    about = "Track current weather and daily forecasts for a set of cities"
)]
pub struct Cli {
    /// City to track. Repeat the flag or pass a comma-delimited list.
    #[arg(
        long = "city",
        value_delimiter = ',',
        default_values_t = ["lyon".to_string(), "dijon".to_string(), "albi".to_string()]
    )]
    pub cities: Vec<String>,

    /// OpenWeather API key.
    #[arg(long, env = "OPENWEATHER_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(
        long,
        env = "OPENWEATHER_API_BASE",
        default_value = "https://api.openweathermap.org/data/2.5"
    )]
    pub api_base: String,
}
