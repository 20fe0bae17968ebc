// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 单帧检测结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResult {
    pub bboxes: Vec<Bbox>,
}

impl DetectionResult {
    pub fn new(bboxes: Vec<Bbox>) -> Self {
        Self { bboxes }
    }

    pub fn bboxes(&self) -> &[Bbox] {
        &self.bboxes
    }

    pub fn is_empty(&self) -> bool {
        self.bboxes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bboxes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    /// 整数角点坐标 [x1, y1, x2, y2] (截断取整)
    pub fn xyxy_i32(&self) -> [i32; 4] {
        [
            self.xmin() as i32,
            self.ymin() as i32,
            self.xmax() as i32,
            self.ymax() as i32,
        ]
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = (self.xmin + self.width).min(another.xmin + another.width);
        let t = self.ymin.max(another.ymin);
        let b = (self.ymin + self.height).min(another.ymin + another.height);
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_and_area() {
        let b = Bbox::new(10.0, 20.0, 100.0, 50.0, 3, 0.8);
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 50.0);
        assert_eq!(b.area(), 5000.0);
        assert_eq!(b.xyxy_i32(), [10, 20, 110, 70]);
    }

    #[test]
    fn xyxy_truncates_fractional_coordinates() {
        let b = Bbox::new(1.9, 2.2, 28.8, 38.75, 0, 0.5);
        assert_eq!(b.xyxy_i32(), [1, 2, 30, 40]);
    }

    #[test]
    fn iou_counts_pixels_inclusively() {
        let b = Bbox::new(0.0, 0.0, 9.0, 9.0, 0, 0.5);
        // (9 + 1)^2 / (81 + 81 - 100)
        let expected = 100.0 / 62.0;
        assert!((b.iou(&b) - expected).abs() < 1e-5);
    }

    #[test]
    fn iou_of_far_boxes_is_zero() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0, 0, 0.5);
        let b = Bbox::new(100.0, 100.0, 10.0, 10.0, 0, 0.5);
        assert_eq!(a.iou(&b), 0.0);
    }
}
