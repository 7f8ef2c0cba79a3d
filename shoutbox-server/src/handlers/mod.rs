pub mod shoutbox;
pub mod users;
