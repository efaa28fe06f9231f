pub mod daily_menu;
pub mod food;
