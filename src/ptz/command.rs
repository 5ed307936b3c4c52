//! 云台动作与控制报文

use std::fmt;
use std::str::FromStr;

use crate::config::PtzConfig;
use crate::error::Error;

/// 可切换的云台动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtzAction {
    Up,
    Down,
    Left,
    Right,
    Wiper,
    ZoomIn,
    ZoomOut,
}

impl PtzAction {
    pub const ALL: [PtzAction; 7] = [
        PtzAction::Up,
        PtzAction::Down,
        PtzAction::Left,
        PtzAction::Right,
        PtzAction::Wiper,
        PtzAction::ZoomIn,
        PtzAction::ZoomOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PtzAction::Up => "up",
            PtzAction::Down => "down",
            PtzAction::Left => "left",
            PtzAction::Right => "right",
            PtzAction::Wiper => "wiper",
            PtzAction::ZoomIn => "zoom_in",
            PtzAction::ZoomOut => "zoom_out",
        }
    }

    /// 方向动作 (ptz_fixed 机位不支持)
    pub fn is_directional(&self) -> bool {
        matches!(
            self,
            PtzAction::Up | PtzAction::Down | PtzAction::Left | PtzAction::Right
        )
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for PtzAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PtzAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PtzAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("未知云台动作: {}", s)))
    }
}

pub const AUTOFOCUS: &str = "type=ptz&focus=pushaf";
pub const STOP_MOVE: &str = "type=ptz&move=stop";
pub const STOP_ZOOM: &str = "type=ptz&zoom=stop";

/// 报文编码
#[derive(Debug, Clone, Copy)]
pub struct CommandTable {
    pan_speed: u32,
    zoom_in_speed: u32,
    zoom_out_speed: u32,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new(&PtzConfig::default())
    }
}

impl CommandTable {
    pub fn new(config: &PtzConfig) -> Self {
        Self {
            pan_speed: config.pan_speed,
            zoom_in_speed: config.zoom_in_speed,
            zoom_out_speed: config.zoom_out_speed,
        }
    }

    /// 动作切换到 `active` 时要发送的报文
    pub fn toggle(&self, action: PtzAction, active: bool) -> String {
        match (action, active) {
            (PtzAction::Wiper, true) => "type=ptz&aux_on=2".to_string(),
            (PtzAction::Wiper, false) => "type=ptz&aux_on=0".to_string(),
            (PtzAction::ZoomIn, true) => format!("type=ptz&zoom=tele&zspd={}", self.zoom_in_speed),
            (PtzAction::ZoomOut, true) => format!("type=ptz&zoom=wide&zspd={}", self.zoom_out_speed),
            (PtzAction::ZoomIn | PtzAction::ZoomOut, false) => STOP_ZOOM.to_string(),
            (direction, true) => format!("type=ptz&move={}&pspd={}", direction.as_str(), self.pan_speed),
            (_, false) => STOP_MOVE.to_string(),
        }
    }

    /// 绝对变焦, 级别限制在 0..=100
    pub fn set_zoom(&self, level: i64) -> String {
        format!("type=ptz&position=set&zoom_pos={}", level.clamp(0, 100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table_matches_camera_protocol() {
        let t = CommandTable::default();
        assert_eq!(t.toggle(PtzAction::Left, true), "type=ptz&move=left&pspd=30");
        assert_eq!(t.toggle(PtzAction::Up, true), "type=ptz&move=up&pspd=30");
        assert_eq!(t.toggle(PtzAction::Down, false), "type=ptz&move=stop");
        assert_eq!(t.toggle(PtzAction::Wiper, true), "type=ptz&aux_on=2");
        assert_eq!(t.toggle(PtzAction::Wiper, false), "type=ptz&aux_on=0");
        assert_eq!(t.toggle(PtzAction::ZoomIn, true), "type=ptz&zoom=tele&zspd=5");
        assert_eq!(t.toggle(PtzAction::ZoomOut, true), "type=ptz&zoom=wide&zspd=30");
        assert_eq!(t.toggle(PtzAction::ZoomOut, false), "type=ptz&zoom=stop");
    }

    #[test]
    fn zoom_level_is_clamped() {
        let t = CommandTable::default();
        assert_eq!(t.set_zoom(40), "type=ptz&position=set&zoom_pos=40");
        assert_eq!(t.set_zoom(-3), "type=ptz&position=set&zoom_pos=0");
        assert_eq!(t.set_zoom(250), "type=ptz&position=set&zoom_pos=100");
    }

    #[test]
    fn speeds_follow_config() {
        let config = PtzConfig {
            pan_speed: 12,
            zoom_in_speed: 3,
            ..PtzConfig::default()
        };
        let t = CommandTable::new(&config);
        assert_eq!(t.toggle(PtzAction::Right, true), "type=ptz&move=right&pspd=12");
        assert_eq!(t.toggle(PtzAction::ZoomIn, true), "type=ptz&zoom=tele&zspd=3");
    }

    #[test]
    fn actions_parse_by_name() {
        assert_eq!("zoom_in".parse::<PtzAction>().unwrap(), PtzAction::ZoomIn);
        assert_eq!("LEFT".parse::<PtzAction>().unwrap(), PtzAction::Left);
        assert!("spin".parse::<PtzAction>().is_err());
        assert!(PtzAction::Up.is_directional());
        assert!(!PtzAction::Wiper.is_directional());
    }
}
