// src/render.rs - Overlay composition and the drawing surface
use crate::camera::FrameSize;
use crate::config::OverlayConfig;
use crate::measurement::MeasurementResult;
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_polygon_mut};
use imageproc::point::Point;
use nalgebra::{Point2, Vector2};
use std::sync::{Arc, Mutex};

/// What gets drawn over the video for one frame, in display coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub points: Vec<Point2<f32>>,
    pub guide: Option<[Point2<f32>; 2]>,
    pub caption: Option<String>,
}

impl Overlay {
    /// Build the overlay from pixel-space shoulders. With `mirror` set the
    /// points are flipped horizontally to line up with a mirrored video.
    pub fn compose(
        shoulders: Option<(Point2<f64>, Point2<f64>)>,
        measurement: Option<&MeasurementResult>,
        size: FrameSize,
        mirror: bool,
    ) -> Self {
        let to_display = |p: Point2<f64>| {
            let x = if mirror { size.width as f64 - p.x } else { p.x };
            Point2::new(x as f32, p.y as f32)
        };

        let mut overlay = Overlay::default();
        if let Some((left, right)) = shoulders {
            let (l, r) = (to_display(left), to_display(right));
            overlay.points = vec![l, r];
            overlay.guide = Some([l, r]);
        }
        overlay.caption = measurement.map(|m| {
            format!("Shoulder width: {:.0} cm ({})", m.estimated_width_cm, m.size_class)
        });
        overlay
    }
}

/// A 2D surface the overlay is drawn on, sized to the video's native resolution.
pub trait RenderSurface: Send {
    fn size(&self) -> FrameSize;
    fn resize(&mut self, size: FrameSize);
    fn present(&mut self, overlay: &Overlay);
}

pub type SharedSurface = Arc<Mutex<dyn RenderSurface>>;

/// Rasterizes overlays into an RGBA buffer.
pub struct ImageSurface {
    canvas: RgbaImage,
    style: OverlayConfig,
    caption: Option<String>,
    presented: u64,
}

impl ImageSurface {
    pub fn new(style: OverlayConfig) -> Self {
        Self {
            canvas: RgbaImage::new(0, 0),
            style,
            caption: None,
            presented: 0,
        }
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    /// Frames presented since creation.
    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn into_shared(self) -> Arc<Mutex<ImageSurface>> {
        Arc::new(Mutex::new(self))
    }
}

impl RenderSurface for ImageSurface {
    fn size(&self) -> FrameSize {
        FrameSize::new(self.canvas.width(), self.canvas.height())
    }

    fn resize(&mut self, size: FrameSize) {
        if self.size() != size {
            self.canvas = RgbaImage::new(size.width, size.height);
        }
    }

    fn present(&mut self, overlay: &Overlay) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }

        if let Some([from, to]) = overlay.guide {
            draw_guide(
                &mut self.canvas,
                from,
                to,
                self.style.line_width,
                Rgba(self.style.line_color),
            );
        }
        for point in &overlay.points {
            draw_dot(
                &mut self.canvas,
                *point,
                self.style.point_radius,
                Rgba(self.style.point_color),
            );
        }

        self.caption = overlay.caption.clone();
        self.presented += 1;
    }
}

fn draw_dot(canvas: &mut RgbaImage, center: Point2<f32>, radius: u32, color: Rgba<u8>) {
    let r = radius.max(1) as f32;
    let (w, h) = (canvas.width() as f32, canvas.height() as f32);
    if !(center.x > -r && center.y > -r && center.x < w + r && center.y < h + r) {
        return;
    }
    draw_filled_circle_mut(
        canvas,
        (center.x.round() as i32, center.y.round() as i32),
        r as i32,
        color,
    );
}

/// A `width`-pixel line with round caps, clipped to the canvas.
fn draw_guide(canvas: &mut RgbaImage, from: Point2<f32>, to: Point2<f32>, width: u32, color: Rgba<u8>) {
    let margin = width as f32;
    let bounds = (
        Point2::new(-margin, -margin),
        Point2::new(canvas.width() as f32 + margin, canvas.height() as f32 + margin),
    );
    let Some((from, to)) = clip_segment(from, to, bounds) else {
        return;
    };

    let half = width as f32 / 2.0;
    let along = to - from;
    let length = along.norm();
    if width <= 1 || length < 1.0 {
        draw_line_segment_mut(canvas, (from.x, from.y), (to.x, to.y), color);
    } else {
        let normal = Vector2::new(-along.y, along.x) * (half / length);
        let corners = [from + normal, to + normal, to - normal, from - normal]
            .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32));
        if corners[0] != corners[3] {
            draw_polygon_mut(canvas, &corners, color);
        } else {
            draw_line_segment_mut(canvas, (from.x, from.y), (to.x, to.y), color);
        }
    }

    if width > 1 {
        let cap = half.round() as u32;
        draw_dot(canvas, from, cap, color);
        draw_dot(canvas, to, cap, color);
    }
}

/// Liang-Barsky clip of a segment to an axis-aligned box. Runs in f64 so
/// far off-canvas endpoints keep their precision.
fn clip_segment(
    from: Point2<f32>,
    to: Point2<f32>,
    (min, max): (Point2<f32>, Point2<f32>),
) -> Option<(Point2<f32>, Point2<f32>)> {
    if ![from.x, from.y, to.x, to.y].iter().all(|v| v.is_finite()) {
        return None;
    }
    let (from, to) = (from.cast::<f64>(), to.cast::<f64>());
    let (min, max) = (min.cast::<f64>(), max.cast::<f64>());
    let d = to - from;
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [
        (-d.x, from.x - min.x),
        (d.x, max.x - from.x),
        (-d.y, from.y - min.y),
        (d.y, max.y - from.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                t0 = t0.max(r);
            } else {
                if r < t0 {
                    return None;
                }
                t1 = t1.min(r);
            }
        }
    }
    Some(((from + d * t0).cast::<f32>(), (from + d * t1).cast::<f32>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::SizeClass;

    fn result(width: f64, size_class: SizeClass) -> MeasurementResult {
        MeasurementResult {
            pixel_distance: 150.0,
            estimated_width_cm: width,
            size_class,
        }
    }

    #[test]
    fn compose_mirrors_horizontally() {
        let size = FrameSize::new(1000, 500);
        let shoulders = Some((Point2::new(400.0, 200.0), Point2::new(600.0, 210.0)));

        let plain = Overlay::compose(shoulders, None, size, false);
        assert_eq!(plain.points, vec![Point2::new(400.0, 200.0), Point2::new(600.0, 210.0)]);

        let mirrored = Overlay::compose(shoulders, None, size, true);
        assert_eq!(mirrored.points, vec![Point2::new(600.0, 200.0), Point2::new(400.0, 210.0)]);
        assert_eq!(mirrored.guide, Some([mirrored.points[0], mirrored.points[1]]));
    }

    #[test]
    fn caption_reports_width_and_size() {
        let m = result(43.4, SizeClass::M);
        let overlay = Overlay::compose(None, Some(&m), FrameSize::new(10, 10), true);
        assert!(overlay.points.is_empty());
        assert_eq!(overlay.caption.as_deref(), Some("Shoulder width: 43 cm (M)"));
    }

    #[test]
    fn surface_resizes_and_draws_points() {
        let mut surface = ImageSurface::new(OverlayConfig::default());
        assert_eq!(surface.size(), FrameSize::new(0, 0));

        surface.resize(FrameSize::new(200, 100));
        assert_eq!(surface.size(), FrameSize::new(200, 100));

        let overlay = Overlay::compose(
            Some((Point2::new(50.0, 50.0), Point2::new(150.0, 50.0))),
            Some(&result(47.0, SizeClass::L)),
            surface.size(),
            false,
        );
        surface.present(&overlay);

        let point_color = Rgba(OverlayConfig::default().point_color);
        let line_color = Rgba(OverlayConfig::default().line_color);
        assert_eq!(*surface.canvas().get_pixel(50, 50), point_color);
        assert_eq!(*surface.canvas().get_pixel(100, 50), line_color);
        assert_eq!(*surface.canvas().get_pixel(100, 90), Rgba([0, 0, 0, 0]));
        assert_eq!(surface.caption(), Some("Shoulder width: 47 cm (L)"));
        assert_eq!(surface.presented_frames(), 1);
    }

    #[test]
    fn present_clears_previous_frame() {
        let mut surface = ImageSurface::new(OverlayConfig::default());
        surface.resize(FrameSize::new(100, 100));
        surface.present(&Overlay::compose(
            Some((Point2::new(20.0, 20.0), Point2::new(80.0, 20.0))),
            None,
            surface.size(),
            false,
        ));
        surface.present(&Overlay::default());

        assert!(surface.canvas().pixels().all(|p| p.0[3] == 0));
        assert_eq!(surface.caption(), None);
    }

    #[test]
    fn drawing_off_canvas_is_clipped() {
        let mut surface = ImageSurface::new(OverlayConfig::default());
        surface.resize(FrameSize::new(20, 20));
        surface.present(&Overlay {
            points: vec![Point2::new(-5.0, -5.0), Point2::new(30.0, 30.0)],
            guide: None,
            caption: None,
        });
        assert_eq!(surface.presented_frames(), 1);
    }

    #[test]
    fn far_off_canvas_guide_is_clipped() {
        let mut surface = ImageSurface::new(OverlayConfig::default());
        surface.resize(FrameSize::new(40, 20));
        surface.present(&Overlay {
            points: vec![],
            guide: Some([Point2::new(-1.0e9, 10.0), Point2::new(1.0e9, 10.0)]),
            caption: None,
        });

        let line_color = Rgba(OverlayConfig::default().line_color);
        assert_eq!(*surface.canvas().get_pixel(0, 10), line_color);
        assert_eq!(*surface.canvas().get_pixel(39, 10), line_color);
        assert_eq!(*surface.canvas().get_pixel(20, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn clip_segment_cases() {
        let bounds = (Point2::new(0.0, 0.0), Point2::new(10.0, 10.0));

        let near = |p: Point2<f32>, x: f32, y: f32| (p.x - x).abs() < 1e-4 && (p.y - y).abs() < 1e-4;

        let (a, b) = clip_segment(Point2::new(1.0, 1.0), Point2::new(9.0, 9.0), bounds).unwrap();
        assert!(near(a, 1.0, 1.0) && near(b, 9.0, 9.0));

        let (a, b) = clip_segment(Point2::new(-10.0, 5.0), Point2::new(20.0, 5.0), bounds).unwrap();
        assert!(near(a, 0.0, 5.0) && near(b, 10.0, 5.0));

        let (a, b) = clip_segment(Point2::new(-1.0e9, 5.0), Point2::new(1.0e9, 5.0), bounds).unwrap();
        assert!(near(a, 0.0, 5.0) && near(b, 10.0, 5.0));

        assert_eq!(clip_segment(Point2::new(-5.0, -5.0), Point2::new(-1.0, 20.0), bounds), None);
        assert_eq!(clip_segment(Point2::new(f32::NAN, 0.0), Point2::new(1.0, 1.0), bounds), None);
    }

    #[test]
    fn guide_honours_line_width() {
        let mut style = OverlayConfig::default();
        style.line_width = 9;
        let mut surface = ImageSurface::new(style.clone());
        surface.resize(FrameSize::new(100, 40));
        surface.present(&Overlay {
            points: vec![],
            guide: Some([Point2::new(10.0, 20.0), Point2::new(90.0, 20.0)]),
            caption: None,
        });

        let line_color = Rgba(style.line_color);
        assert_eq!(*surface.canvas().get_pixel(50, 17), line_color);
        assert_eq!(*surface.canvas().get_pixel(50, 23), line_color);
        assert_eq!(*surface.canvas().get_pixel(50, 30), Rgba([0, 0, 0, 0]));
    }
}
